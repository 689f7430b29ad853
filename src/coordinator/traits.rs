//! Trait seams to the coordinator's external collaborators.
//!
//! The coordinator consumes four services, all owned by the hosting
//! process: the per-node log engine that runs writer and replica OS
//! processes, the durable topology registry, the fleet membership source,
//! and the consensus layer's client surface. Phases and the executor talk
//! to these exclusively through the traits here — never `apply`.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Epoch, Handle, LogTail, NodeId, ReplyTo, StreamId};

use super::commands::{ClientReply, Command};
use super::stream::StreamConfig;

/// Outcome of creating a stream cluster on the log engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterStart {
    /// Cluster created; `conf` carries the writer and replica handles.
    Started { conf: StreamConfig },
    /// A cluster for this stream already exists; `conf` carries its
    /// current handles. Happens when a resumed phase re-runs.
    AlreadyStarted { conf: StreamConfig },
}

impl ClusterStart {
    pub fn into_conf(self) -> StreamConfig {
        match self {
            ClusterStart::Started { conf } | ClusterStart::AlreadyStarted { conf } => conf,
        }
    }
}

/// Outcome of starting a replica process.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaStart {
    Started(Handle),
    /// The node already hosts replica data for this stream.
    AlreadyPresent,
    /// A replica process is already running.
    AlreadyStarted(Handle),
}

/// Outcome of starting a writer process.
#[derive(Debug, Clone, PartialEq)]
pub enum WriterStart {
    Started(Handle),
    AlreadyStarted(Handle),
}

/// Outcome of stopping a replica process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// The hosting node is unreachable. Tolerated during elections.
    NodeDown,
}

/// Overview of one node's copy of a stream log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOverview {
    /// First and last offset present.
    pub range: (u64, u64),
    /// Epoch boundaries: the last offset written under each epoch.
    pub epoch_offsets: Vec<(u64, Epoch)>,
}

impl LogOverview {
    /// The latest durable position, as used for leader election.
    pub fn tail(&self) -> LogTail {
        match self.epoch_offsets.last() {
            Some(&(offset, epoch)) => LogTail::At { offset, epoch },
            None => LogTail::Empty,
        }
    }
}

/// The per-node log engine: starts and stops writer and replica OS
/// processes for a stream and reports log overviews.
#[async_trait]
pub trait LogEngine: Send + Sync {
    /// Create the cluster: writer on the leader node, replicas elsewhere.
    async fn start_cluster(&self, conf: &StreamConfig) -> Result<ClusterStart>;

    /// Tear the cluster down everywhere. Returns the last known committed
    /// size of the stream.
    async fn delete_cluster(&self, conf: &StreamConfig) -> Result<u64>;

    /// Start a replica process on `node`.
    async fn start_replica(&self, node: &NodeId, conf: &StreamConfig) -> Result<ReplicaStart>;

    /// Stop the replica process on `node`.
    async fn stop_replica(&self, node: &NodeId, conf: &StreamConfig) -> Result<StopOutcome>;

    /// Delete the replica data on `node`.
    async fn delete_replica(&self, node: &NodeId, conf: &StreamConfig) -> Result<()>;

    /// Start the writer process on the configured leader node.
    async fn start_writer(&self, conf: &StreamConfig) -> Result<WriterStart>;

    /// Inspect `node`'s copy of the log under `dir`. `Ok(None)` means the
    /// node is reachable but holds no log; `Err` means unreachable.
    async fn log_overview(&self, node: &NodeId, dir: &str) -> Result<Option<LogOverview>>;
}

/// Whether a registry update found the record it was to modify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// The record vanished (recovery race); the caller re-declares.
    Missing,
}

/// The durable topology registry. All operations are transactional.
#[async_trait]
pub trait StreamRegistry: Send + Sync {
    /// Insert the record for a freshly created stream.
    async fn declare(&self, conf: &StreamConfig) -> Result<()>;

    /// Overwrite the stored topology with the coordinator's authoritative
    /// view.
    async fn update(&self, name: &StreamId, conf: &StreamConfig) -> Result<UpdateOutcome>;

    /// Remove the record.
    async fn delete(&self, name: &StreamId, user: &str) -> Result<()>;
}

/// Which slice of the fleet to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSelector {
    /// Every configured node, up or not.
    All,
    /// Nodes currently up.
    Running,
}

/// The hosting service's view of fleet membership and process liveness.
#[async_trait]
pub trait NodeMembership: Send + Sync {
    async fn cluster_nodes(&self, selector: NodeSelector) -> Result<Vec<NodeId>>;

    /// Best-effort liveness probe for an external process.
    async fn is_alive(&self, handle: &Handle) -> Result<bool>;
}

/// Client surface of the consensus layer: command submission and
/// coordinator membership changes.
#[async_trait]
pub trait ConsensusClient: Send + Sync {
    /// Submit a command and wait for it to commit and apply. The reply is
    /// whatever the state machine addressed to this submission.
    async fn submit(&self, cmd: Command) -> Result<ClientReply>;

    /// Pipelined, best-effort submission used by the aux executor for
    /// phase results and drained pending commands. `from` re-attaches the
    /// original submitter's reply token.
    async fn resubmit(&self, from: Option<ReplyTo>, cmd: Command) -> Result<()>;

    /// Current coordinator Raft members.
    async fn members(&self) -> Result<Vec<NodeId>>;

    /// Start the coordinator machine on a node that is about to join.
    async fn start_member(&self, node: &NodeId) -> Result<()>;

    async fn add_member(&self, node: &NodeId) -> Result<()>;

    async fn remove_member(&self, node: &NodeId) -> Result<()>;
}

/// Leased coordination lock serializing first-time cluster join.
#[async_trait]
pub trait StartupLock: Send + Sync {
    /// Try to take the lease. Returns false if someone else holds it.
    async fn acquire(&self, name: &str, lease: Duration) -> Result<bool>;

    /// Release the lease early.
    async fn release(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_overview_tail_uses_last_epoch_entry() {
        let overview = LogOverview {
            range: (0, 42),
            epoch_offsets: vec![(10, 1), (30, 2), (42, 3)],
        };
        assert_eq!(
            overview.tail(),
            LogTail::At {
                offset: 42,
                epoch: 3
            }
        );
    }

    #[test]
    fn test_log_overview_tail_empty() {
        let overview = LogOverview {
            range: (0, 0),
            epoch_offsets: vec![],
        };
        assert_eq!(overview.tail(), LogTail::Empty);
    }

    #[test]
    fn test_cluster_start_into_conf() {
        let conf = StreamConfig {
            name: std::sync::Arc::from("s"),
            reference: String::new(),
            epoch: 1,
            leader_node: std::sync::Arc::from("n1"),
            leader_handle: None,
            replica_nodes: vec![],
            replica_handles: vec![],
            dir: String::new(),
        };
        assert_eq!(
            ClusterStart::Started { conf: conf.clone() }.into_conf(),
            conf
        );
    }
}
