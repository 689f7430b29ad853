//! Commands and replies for the replicated coordinator state machine.
//!
//! Commands are the inputs to the state machine — they are totally ordered
//! by the consensus layer and applied deterministically on every coordinator
//! replica. External commands originate from clients; internal commands are
//! produced by phase tasks and the consensus layer itself and close the loop
//! on side effects.

use serde::{Deserialize, Serialize};

use crate::types::{Epoch, Handle, LogTail, NodeId, StreamId};

use super::stream::{StreamConfig, StreamSpec};

/// Commands applied to the coordinator state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    // -- external (client-initiated) -------------------------------------
    /// Register `subscriber` for leader events of `stream`.
    Subscribe {
        stream: StreamId,
        subscriber: Handle,
    },

    /// Drop `subscriber`'s registration for `stream`.
    Unsubscribe {
        stream: StreamId,
        subscriber: Handle,
    },

    /// Create a stream cluster.
    StartCluster { spec: StreamSpec },

    /// Tear a stream cluster down.
    DeleteCluster { stream: StreamId, user: String },

    /// Start (or restart) a replica on `node`.
    StartReplica {
        stream: StreamId,
        node: NodeId,
        retries: u32,
    },

    /// Remove the replica hosted on `node`.
    DeleteReplica { stream: StreamId, node: NodeId },

    // -- internal (phase replies and system events) ----------------------
    /// The start-cluster phase completed.
    StartClusterReply {
        stream: StreamId,
        result: Result<StreamConfig, String>,
    },

    /// A replica process came up; `conf` carries the updated topology.
    StartReplicaReply { handle: Handle, conf: StreamConfig },

    /// A replica start attempt failed; the machine schedules a retry.
    StartReplicaFailed {
        stream: StreamId,
        node: NodeId,
        retries: u32,
        reason: String,
    },

    /// The delete-cluster phase completed; `size` is the stream's last
    /// known committed size, surfaced to the caller.
    DeleteClusterReply { stream: StreamId, size: u64 },

    /// The in-flight phase completed; `reply` is forwarded to the stored
    /// originator, if any.
    PhaseFinished { stream: StreamId, reply: ClientReply },

    /// A phase produced an updated topology (replica removal).
    StreamUpdated { conf: StreamConfig },

    /// Every replica process has been stopped for a pending election.
    ReplicasStopped { stream: StreamId },

    /// Quorum check passed; run the election over the reported tails.
    StartLeaderElection {
        stream: StreamId,
        new_epoch: Epoch,
        tails: Vec<(NodeId, LogTail)>,
    },

    /// The new writer is up; `conf` carries its handle.
    LeaderElected { conf: StreamConfig },

    /// A monitored process died.
    Down { handle: Handle, reason: DownReason },
}

impl Command {
    /// Stable name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::StartCluster { .. } => "start_cluster",
            Command::DeleteCluster { .. } => "delete_cluster",
            Command::StartReplica { .. } => "start_replica",
            Command::DeleteReplica { .. } => "delete_replica",
            Command::StartClusterReply { .. } => "start_cluster_reply",
            Command::StartReplicaReply { .. } => "start_replica_reply",
            Command::StartReplicaFailed { .. } => "start_replica_failed",
            Command::DeleteClusterReply { .. } => "delete_cluster_reply",
            Command::PhaseFinished { .. } => "phase_finished",
            Command::StreamUpdated { .. } => "stream_updated",
            Command::ReplicasStopped { .. } => "replicas_stopped",
            Command::StartLeaderElection { .. } => "start_leader_election",
            Command::LeaderElected { .. } => "leader_elected",
            Command::Down { .. } => "down",
        }
    }
}

/// A command buffered while its stream was non-running, together with the
/// originator token of its first submission. Drained commands are
/// resubmitted through the consensus log with their token re-attached so
/// the original caller still receives a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCmd {
    pub from: Option<crate::types::ReplyTo>,
    pub cmd: Command,
}

/// Why a monitored process died.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownReason {
    /// Clean exit.
    Normal,
    /// Crashed or was killed; carries the reported reason.
    Crashed(String),
    /// The hosting node went down.
    NodeDown,
}

/// Replies surfaced to command originators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientReply {
    /// Generic success.
    Ok,

    /// Cluster creation completed; carries the resulting topology.
    StreamStarted { conf: StreamConfig },

    /// Cluster deletion completed; carries the last known committed size.
    StreamDeleted { size: u64 },

    /// Client-class failure.
    Error(ErrorReply),
}

/// Client-class failures carried inside a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorReply {
    /// The named stream is not managed by this coordinator.
    NotFound,
    /// A stream with this name already exists.
    AlreadyStarted,
    /// A replica start failed; the coordinator retries on its own, this
    /// reply only informs the originator of the first failure.
    ReplicaStartFailed { node: NodeId, reason: String },
}
