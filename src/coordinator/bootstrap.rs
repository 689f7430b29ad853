//! First-start, join, and restart logic for a coordinator replica.
//!
//! A replica coming up has to decide between three paths: resume from
//! local consensus state (restart), join a coordinator cluster another
//! node already runs, or initialize a brand new cluster. The decision
//! between the last two is racy when a whole fleet boots at once, so it is
//! serialized through a leased lock at a well-known coordination key.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::types::NodeId;

use super::traits::{NodeMembership, NodeSelector, StartupLock};

/// How this replica should come up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapPlan {
    /// Local consensus state exists: resume from it.
    Restart,
    /// Other fleet nodes are up: join their coordinator cluster.
    JoinExisting { seeds: Vec<NodeId> },
    /// This is the first node: initialize a new cluster.
    InitializeNew,
}

/// Decides the bootstrap path for one replica.
pub struct Bootstrapper {
    node: NodeId,
    config: CoordinatorConfig,
    membership: Arc<dyn NodeMembership>,
    lock: Arc<dyn StartupLock>,
}

impl Bootstrapper {
    pub fn new(
        node: NodeId,
        config: CoordinatorConfig,
        membership: Arc<dyn NodeMembership>,
        lock: Arc<dyn StartupLock>,
    ) -> Self {
        Self {
            node,
            config,
            membership,
            lock,
        }
    }

    /// Decide how to come up. `has_local_state` is whether the consensus
    /// layer found durable coordinator state on disk.
    pub async fn plan(&self, has_local_state: bool) -> Result<BootstrapPlan> {
        if has_local_state {
            info!(node = %self.node, "Resuming coordinator from local state");
            return Ok(BootstrapPlan::Restart);
        }

        self.acquire_lock().await?;
        let plan = self.decide().await;
        self.lock.release(&self.config.startup_lock_name).await?;
        plan
    }

    async fn decide(&self) -> Result<BootstrapPlan> {
        let mut seeds = self
            .membership
            .cluster_nodes(NodeSelector::Running)
            .await?;
        seeds.retain(|n| n != &self.node);

        if seeds.is_empty() {
            info!(node = %self.node, "No running peers, initializing new coordinator cluster");
            Ok(BootstrapPlan::InitializeNew)
        } else {
            info!(node = %self.node, peers = seeds.len(), "Joining existing coordinator cluster");
            Ok(BootstrapPlan::JoinExisting { seeds })
        }
    }

    /// Take the startup lease, waiting out whoever holds it. Bounded: a
    /// holder that never releases is a deployment fault, not something to
    /// spin on forever.
    async fn acquire_lock(&self) -> Result<()> {
        let name = &self.config.startup_lock_name;
        let lease = self.config.startup_lock_lease;
        // Worst case one full lease, polled in tenths.
        let poll = lease / 10;
        for _ in 0..=10 {
            if self.lock.acquire(name, lease).await? {
                return Ok(());
            }
            debug!(node = %self.node, lock = %name, "Startup lock held, waiting");
            sleep(poll).await;
        }
        Err(CoordinatorError::Timeout(lease))
    }
}
