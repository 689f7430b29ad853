//! Per-stream topology, lifecycle state, and leader election.
//!
//! Each managed stream carries a [`StreamConfig`] (the authoritative
//! topology) and a [`StreamState`] (where the stream sits in its lifecycle
//! FSM). Both are part of the replicated coordinator state and must stay
//! serde-serializable and deterministic.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::types::{Epoch, Handle, LogTail, NodeId, ReplyTo, StreamId};

use super::commands::PendingCmd;

/// Client-supplied description of a stream cluster to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    /// Stream name, unique across the coordinator.
    pub name: StreamId,
    /// External resource reference carried through to subscriber events.
    pub reference: String,
    /// Node that should host the initial writer.
    pub leader_node: NodeId,
    /// Nodes that should host replicas.
    pub replica_nodes: Vec<NodeId>,
    /// Log directory on each node.
    pub dir: String,
}

/// Authoritative topology of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: StreamId,
    /// External resource reference carried through to subscriber events.
    pub reference: String,
    /// Leadership generation. Incremented by exactly one per election.
    pub epoch: Epoch,
    /// Node hosting the writer.
    pub leader_node: NodeId,
    /// Writer process, once started.
    pub leader_handle: Option<Handle>,
    /// Nodes hosting replicas. Never contains `leader_node`.
    pub replica_nodes: Vec<NodeId>,
    /// Live replica processes.
    pub replica_handles: Vec<Handle>,
    /// Log directory on each node, consulted by the quorum check.
    pub dir: String,
}

impl StreamConfig {
    /// Initial configuration for a cluster being created. The leader node
    /// is filtered out of the replica set, which must never contain it.
    pub fn from_spec(spec: &StreamSpec) -> Self {
        let mut replica_nodes = spec.replica_nodes.clone();
        replica_nodes.retain(|n| n != &spec.leader_node);
        Self {
            name: spec.name.clone(),
            reference: spec.reference.clone(),
            epoch: 1,
            leader_node: spec.leader_node.clone(),
            leader_handle: None,
            replica_nodes,
            replica_handles: Vec::new(),
            dir: spec.dir.clone(),
        }
    }

    /// All nodes participating in the stream: replicas plus the leader.
    pub fn member_nodes(&self) -> Vec<NodeId> {
        let mut nodes = self.replica_nodes.clone();
        nodes.push(self.leader_node.clone());
        nodes
    }

    /// Every live process handle: the writer plus all replicas.
    pub fn all_handles(&self) -> Vec<Handle> {
        let mut handles = self.replica_handles.clone();
        if let Some(leader) = &self.leader_handle {
            handles.push(leader.clone());
        }
        handles
    }

    /// Drop the replica handle hosted on `node`, if any.
    pub fn remove_replica_handle_on(&mut self, node: &NodeId) {
        self.replica_handles.retain(|h| &h.node != node);
    }
}

/// Lifecycle state of a stream.
///
/// `Running` is the only state in which client commands execute directly;
/// every other state has a phase in flight and buffers incoming commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    StartCluster,
    Running,
    DeleteCluster,
    StartReplica,
    DeleteReplica,
    LeaderElection,
    ReplicaRestart,
}

impl StreamStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, StreamStatus::Running)
    }
}

/// Which kind of durable-registry repair a phase performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryRepair {
    /// Insert the record for a freshly created stream.
    New,
    /// Update the record after a topology change.
    Update,
}

/// A side-effecting phase, carrying everything needed to (re-)invoke it.
///
/// Phases run on the current consensus leader only. The arguments are kept
/// in replicated state so a new leader can resume the in-flight phase after
/// a coordinator leadership transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    StartCluster {
        conf: StreamConfig,
    },
    DeleteCluster {
        conf: StreamConfig,
    },
    StartReplica {
        node: NodeId,
        conf: StreamConfig,
        retries: u32,
    },
    DeleteReplica {
        node: NodeId,
        conf: StreamConfig,
    },
    StopReplicas {
        conf: StreamConfig,
    },
    CheckQuorum {
        conf: StreamConfig,
    },
    StartNewLeader {
        conf: StreamConfig,
    },
    RepairRegistry {
        repair: RegistryRepair,
        conf: StreamConfig,
    },
}

impl Phase {
    /// Stable name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Phase::StartCluster { .. } => "start_cluster",
            Phase::DeleteCluster { .. } => "delete_cluster",
            Phase::StartReplica { .. } => "start_replica",
            Phase::DeleteReplica { .. } => "delete_replica",
            Phase::StopReplicas { .. } => "stop_replicas",
            Phase::CheckQuorum { .. } => "check_quorum",
            Phase::StartNewLeader { .. } => "start_new_leader",
            Phase::RepairRegistry { .. } => "repair_registry",
        }
    }

    /// The stream this phase operates on.
    pub fn stream(&self) -> &StreamId {
        match self {
            Phase::StartCluster { conf }
            | Phase::DeleteCluster { conf }
            | Phase::StartReplica { conf, .. }
            | Phase::DeleteReplica { conf, .. }
            | Phase::StopReplicas { conf }
            | Phase::CheckQuorum { conf }
            | Phase::StartNewLeader { conf }
            | Phase::RepairRegistry { conf, .. } => &conf.name,
        }
    }
}

/// Full replicated state of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    pub conf: StreamConfig,
    pub status: StreamStatus,
    /// The in-flight phase, if any. `None` exactly when `Running`.
    pub phase: Option<Phase>,
    /// Originator of the command that started the in-flight phase.
    pub reply_to: Option<ReplyTo>,
    /// Commands accepted while non-running; drained FIFO on return to
    /// `Running`. Each keeps its originator token so drained client
    /// commands still reach their caller.
    pub pending_cmds: VecDeque<PendingCmd>,
    /// Nodes awaiting a replica (re)start.
    pub pending_replicas: BTreeSet<NodeId>,
    /// Subscribers interested in leader events for this stream.
    pub subscribers: BTreeSet<Handle>,
}

impl StreamState {
    /// Fresh stream entry entering cluster creation.
    pub fn new(conf: StreamConfig, reply_to: Option<ReplyTo>) -> Self {
        let phase = Phase::StartCluster { conf: conf.clone() };
        Self {
            conf,
            status: StreamStatus::StartCluster,
            phase: Some(phase),
            reply_to,
            pending_cmds: VecDeque::new(),
            pending_replicas: BTreeSet::new(),
            subscribers: BTreeSet::new(),
        }
    }

    /// Move to a new lifecycle state with a phase in flight.
    pub fn enter(&mut self, status: StreamStatus, phase: Phase, reply_to: Option<ReplyTo>) {
        self.status = status;
        self.phase = Some(phase);
        self.reply_to = reply_to;
    }

    /// Swap the in-flight phase without changing the lifecycle state.
    pub fn continue_with(&mut self, phase: Phase) {
        self.phase = Some(phase);
    }

    /// Return to `Running`, draining the pending command queue.
    pub fn finish(&mut self) -> Vec<PendingCmd> {
        self.status = StreamStatus::Running;
        self.phase = None;
        self.reply_to = None;
        self.pending_cmds.drain(..).collect()
    }
}

/// Pick the new leader from the log tails reported by a quorum check.
///
/// Highest tail wins: offsets compare first, epochs break offset ties, and
/// `Empty` loses to any real tail. Remaining ties are broken by node
/// identifier so every replica elects the same node.
pub fn select_leader(tails: &[(NodeId, LogTail)]) -> Option<NodeId> {
    tails
        .iter()
        .max_by(|(na, ta), (nb, tb)| ta.cmp(tb).then_with(|| na.cmp(nb)))
        .map(|(node, _)| node.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn node(s: &str) -> NodeId {
        Arc::from(s)
    }

    fn spec() -> StreamSpec {
        StreamSpec {
            name: Arc::from("orders"),
            reference: "queue/orders".to_string(),
            leader_node: node("n1"),
            replica_nodes: vec![node("n2"), node("n3")],
            dir: "/var/lib/rivulet/orders".to_string(),
        }
    }

    #[test]
    fn test_config_from_spec_starts_at_epoch_one() {
        let conf = StreamConfig::from_spec(&spec());
        assert_eq!(conf.epoch, 1);
        assert!(conf.leader_handle.is_none());
        assert!(conf.replica_handles.is_empty());
    }

    #[test]
    fn test_member_nodes_includes_leader() {
        let conf = StreamConfig::from_spec(&spec());
        let members = conf.member_nodes();
        assert_eq!(members.len(), 3);
        assert!(members.contains(&node("n1")));
    }

    #[test]
    fn test_select_leader_prefers_highest_offset() {
        let tails = vec![
            (node("n1"), LogTail::At { offset: 5, epoch: 9 }),
            (
                node("n2"),
                LogTail::At {
                    offset: 12,
                    epoch: 1,
                },
            ),
            (node("n3"), LogTail::At { offset: 7, epoch: 3 }),
        ];
        assert_eq!(select_leader(&tails), Some(node("n2")));
    }

    #[test]
    fn test_select_leader_breaks_offset_ties_by_epoch() {
        let tails = vec![
            (node("n1"), LogTail::At { offset: 9, epoch: 2 }),
            (node("n2"), LogTail::At { offset: 9, epoch: 4 }),
        ];
        assert_eq!(select_leader(&tails), Some(node("n2")));
    }

    #[test]
    fn test_select_leader_empty_loses_to_any_offset() {
        let tails = vec![
            (node("n1"), LogTail::Empty),
            (node("n2"), LogTail::At { offset: 0, epoch: 0 }),
        ];
        assert_eq!(select_leader(&tails), Some(node("n2")));
    }

    #[test]
    fn test_select_leader_full_tie_is_deterministic() {
        let tails = vec![
            (node("n2"), LogTail::At { offset: 3, epoch: 1 }),
            (node("n1"), LogTail::At { offset: 3, epoch: 1 }),
            (node("n3"), LogTail::At { offset: 3, epoch: 1 }),
        ];
        // Ties resolve to the highest node identifier, regardless of input
        // order.
        assert_eq!(select_leader(&tails), Some(node("n3")));
        let mut reversed = tails.clone();
        reversed.reverse();
        assert_eq!(select_leader(&reversed), Some(node("n3")));
    }

    #[test]
    fn test_select_leader_no_candidates() {
        assert_eq!(select_leader(&[]), None);
    }

    #[test]
    fn test_finish_drains_pending_fifo() {
        let conf = StreamConfig::from_spec(&spec());
        let mut state = StreamState::new(conf, None);
        state.pending_cmds.push_back(PendingCmd {
            from: Some(7),
            cmd: super::super::commands::Command::DeleteReplica {
                stream: Arc::from("orders"),
                node: node("n2"),
            },
        });
        let drained = state.finish();
        assert_eq!(drained.len(), 1);
        assert!(state.pending_cmds.is_empty());
        assert_eq!(state.status, StreamStatus::Running);
        assert!(state.phase.is_none());
        assert!(state.reply_to.is_none());
    }
}
