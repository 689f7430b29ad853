//! Coordinator cluster membership reconciliation.
//!
//! On each tick the consensus leader diffs its own Raft member set against
//! the fleet's node list: nodes that came up join the coordinator cluster,
//! nodes removed from the fleet configuration leave it. A node that is
//! merely down stays a member — only disappearing from the configured
//! fleet removes it.

use std::collections::BTreeSet;

use tracing::info;

use crate::error::Result;
use crate::metrics;
use crate::types::NodeId;

use super::traits::{ConsensusClient, NodeMembership, NodeSelector};

/// What one reconcile pass changed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResizeSummary {
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

impl ResizeSummary {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Reconcile coordinator Raft membership with the fleet node list.
///
/// New nodes are `running − members`: each gets the coordinator machine
/// started, then joins as a member. Gone nodes are `members − all`:
/// removed from membership outright.
pub async fn reconcile(
    consensus: &dyn ConsensusClient,
    membership: &dyn NodeMembership,
) -> Result<ResizeSummary> {
    let members: BTreeSet<NodeId> = consensus.members().await?.into_iter().collect();
    let running: BTreeSet<NodeId> = membership
        .cluster_nodes(NodeSelector::Running)
        .await?
        .into_iter()
        .collect();
    let all: BTreeSet<NodeId> = membership
        .cluster_nodes(NodeSelector::All)
        .await?
        .into_iter()
        .collect();

    let mut summary = ResizeSummary::default();

    for node in running.difference(&members) {
        info!(node = %node, "Adding coordinator member");
        consensus.start_member(node).await?;
        consensus.add_member(node).await?;
        metrics::MEMBERSHIP_RESIZES.with_label_values(&["added"]).inc();
        summary.added.push(node.clone());
    }

    for node in members.difference(&all) {
        info!(node = %node, "Removing coordinator member");
        consensus.remove_member(node).await?;
        metrics::MEMBERSHIP_RESIZES
            .with_label_values(&["removed"])
            .inc();
        summary.removed.push(node.clone());
    }

    Ok(summary)
}
