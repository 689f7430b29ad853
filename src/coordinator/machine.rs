//! The replicated coordinator state machine.
//!
//! `apply` is the single place replicated state changes. It is a pure
//! function of `(state, command)`: no clocks, no liveness probes, no I/O.
//! Everything it cannot decide deterministically is pushed out as an
//! [`Effect`] and performed by the consensus layer or the leader-local
//! phase executor, which report back through further commands.
//!
//! Commands that arrive while a stream has a phase in flight are buffered
//! in the stream's pending queue and re-submitted in FIFO order once the
//! stream returns to `Running`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::metrics;
use crate::types::{Handle, LogTail, NodeId, ReplyTo, Role, StreamId};

use super::commands::{ClientReply, Command, DownReason, ErrorReply, PendingCmd};
use super::effects::{AuxRequest, CommandMeta, Effect, RaftRole, StreamEvent};
use super::monitors::MonitorRegistry;
use super::stream::{
    Phase, RegistryRepair, StreamConfig, StreamSpec, StreamState, StreamStatus, select_leader,
};

/// Replicated coordinator state: every managed stream plus the monitor
/// registry. Checkpointed and replayed by the consensus layer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamCoordinator {
    streams: BTreeMap<StreamId, StreamState>,
    monitors: MonitorRegistry,
    /// Local configuration; identical on every replica, not replicated.
    #[serde(skip, default)]
    config: CoordinatorConfig,
}

impl PartialEq for StreamCoordinator {
    fn eq(&self, other: &Self) -> bool {
        self.streams == other.streams && self.monitors == other.monitors
    }
}

impl StreamCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            streams: BTreeMap::new(),
            monitors: MonitorRegistry::new(),
            config,
        }
    }

    /// Read access for queries and tests. Reads on followers may be stale;
    /// linearizable reads go through the consensus layer.
    pub fn stream(&self, id: &StreamId) -> Option<&StreamState> {
        self.streams.get(id)
    }

    pub fn streams(&self) -> &BTreeMap<StreamId, StreamState> {
        &self.streams
    }

    pub fn monitors(&self) -> &MonitorRegistry {
        &self.monitors
    }

    /// Serialize the replicated state for a consensus snapshot.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CoordinatorError::Consensus(e.to_string()))
    }

    /// Replace the replicated state from a consensus snapshot.
    pub fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        let restored: StreamCoordinator = bincode::deserialize(snapshot)
            .map_err(|e| CoordinatorError::Consensus(e.to_string()))?;
        self.streams = restored.streams;
        self.monitors = restored.monitors;
        Ok(())
    }

    /// Apply a replicated command, returning the effects to interpret.
    ///
    /// Deterministic: replaying the same command sequence from the same
    /// state yields the identical state and effect list on every replica.
    pub fn apply(&mut self, meta: &CommandMeta, cmd: Command) -> Vec<Effect> {
        metrics::COMMANDS_APPLIED
            .with_label_values(&[cmd.name()])
            .inc();

        let effects = match cmd {
            Command::Subscribe { stream, subscriber } => {
                self.handle_subscribe(meta, stream, subscriber)
            }
            Command::Unsubscribe { stream, subscriber } => {
                self.handle_unsubscribe(meta, stream, subscriber)
            }
            Command::StartCluster { spec } => self.handle_start_cluster(meta, spec),
            Command::DeleteCluster { stream, user } => {
                self.handle_delete_cluster(meta, stream, user)
            }
            Command::StartReplica {
                stream,
                node,
                retries,
            } => self.handle_start_replica(meta, stream, node, retries),
            Command::DeleteReplica { stream, node } => {
                self.handle_delete_replica(meta, stream, node)
            }
            Command::StartClusterReply { stream, result } => {
                self.handle_start_cluster_reply(stream, result)
            }
            Command::StartReplicaReply { handle, conf } => {
                self.handle_start_replica_reply(handle, conf)
            }
            Command::StartReplicaFailed {
                stream,
                node,
                retries,
                reason,
            } => self.handle_start_replica_failed(stream, node, retries, reason),
            Command::DeleteClusterReply { stream, size } => {
                self.handle_delete_cluster_reply(stream, size)
            }
            Command::PhaseFinished { stream, reply } => self.handle_phase_finished(stream, reply),
            Command::StreamUpdated { conf } => self.handle_stream_updated(conf),
            Command::ReplicasStopped { stream } => self.handle_replicas_stopped(stream),
            Command::StartLeaderElection {
                stream,
                new_epoch,
                tails,
            } => self.handle_start_leader_election(stream, new_epoch, tails),
            Command::LeaderElected { conf } => self.handle_leader_elected(conf),
            Command::Down { handle, reason } => self.handle_down(handle, reason),
        };

        metrics::STREAMS_MANAGED.set(self.streams.len() as i64);
        effects
    }

    /// Effects to re-emit when this replica becomes the consensus leader.
    ///
    /// The aux executor is recreated on every leadership transfer, so the
    /// new leader re-arms all monitors, resumes every in-flight phase, and
    /// re-schedules timer-driven restarts for nodes still awaiting a
    /// replica.
    pub fn state_enter(&self, role: RaftRole) -> Vec<Effect> {
        if role != RaftRole::Leader {
            return Vec::new();
        }

        let mut effects = Vec::new();
        for handle in self.monitors.process_handles() {
            effects.push(Effect::Monitor(handle.clone()));
        }
        for handle in self.monitors.subscriber_handles() {
            effects.push(Effect::Monitor(handle.clone()));
        }
        for (id, st) in &self.streams {
            if let Some(phase) = &st.phase {
                debug!(stream = %id, phase = phase.name(), "Resuming in-flight phase on new leader");
                effects.push(Effect::run_phase(phase.clone()));
            }
            for node in &st.pending_replicas {
                effects.push(Effect::DelayedCmd {
                    delay: self.config.restart_timeout,
                    cmd: Command::StartReplica {
                        stream: id.clone(),
                        node: node.clone(),
                        retries: 1,
                    },
                });
            }
        }
        effects
    }

    /// Periodic tick: ask the aux executor to reconcile coordinator
    /// membership with the fleet.
    pub fn tick(&self) -> Vec<Effect> {
        vec![Effect::Aux(AuxRequest::ReconcileMembers)]
    }

    // -- external commands -----------------------------------------------

    fn handle_subscribe(
        &mut self,
        meta: &CommandMeta,
        stream: StreamId,
        subscriber: Handle,
    ) -> Vec<Effect> {
        let Some(st) = self.streams.get_mut(&stream) else {
            return reply_to(meta, ClientReply::Error(ErrorReply::NotFound));
        };

        if st.subscribers.contains(&subscriber) {
            return reply_to(meta, ClientReply::Ok);
        }

        st.subscribers.insert(subscriber.clone());
        self.monitors.subscribe(subscriber.clone(), stream.clone());

        let mut effects = vec![Effect::Monitor(subscriber.clone())];
        // Liveness is whatever the replicated state records: a present
        // leader handle announces up, an absent one (stream starting, or
        // mid-election) announces down. The subscriber reconciles through
        // subsequent events.
        let event = match &st.conf.leader_handle {
            Some(leader) => StreamEvent::LeaderUp {
                stream: stream.clone(),
                reference: st.conf.reference.clone(),
                leader: leader.clone(),
            },
            None => StreamEvent::LeaderDown {
                stream: stream.clone(),
                reference: st.conf.reference.clone(),
                leader: None,
            },
        };
        effects.push(Effect::SendMsg {
            to: subscriber,
            event,
        });
        effects.extend(reply_to(meta, ClientReply::Ok));
        effects
    }

    fn handle_unsubscribe(
        &mut self,
        meta: &CommandMeta,
        stream: StreamId,
        subscriber: Handle,
    ) -> Vec<Effect> {
        if let Some(st) = self.streams.get_mut(&stream) {
            st.subscribers.remove(&subscriber);
        }
        let mut effects = Vec::new();
        if self.monitors.unsubscribe(&subscriber, &stream) {
            effects.push(Effect::Demonitor(subscriber));
        }
        effects.extend(reply_to(meta, ClientReply::Ok));
        effects
    }

    fn handle_start_cluster(&mut self, meta: &CommandMeta, spec: StreamSpec) -> Vec<Effect> {
        if self.streams.contains_key(&spec.name) {
            return reply_to(meta, ClientReply::Error(ErrorReply::AlreadyStarted));
        }

        let conf = StreamConfig::from_spec(&spec);
        let state = StreamState::new(conf.clone(), meta.from);
        debug!(stream = %spec.name, leader = %conf.leader_node, "Creating stream cluster");
        self.streams.insert(spec.name, state);
        vec![Effect::run_phase(Phase::StartCluster { conf })]
    }

    fn handle_delete_cluster(
        &mut self,
        meta: &CommandMeta,
        stream: StreamId,
        user: String,
    ) -> Vec<Effect> {
        let Some(st) = self.streams.get_mut(&stream) else {
            return reply_to(meta, ClientReply::StreamDeleted { size: 0 });
        };

        match st.status {
            StreamStatus::Running => {
                let conf = st.conf.clone();
                let mut effects = Vec::new();
                for handle in conf.all_handles() {
                    self.monitors.remove_process(&handle);
                    effects.push(Effect::Demonitor(handle));
                }
                let phase = Phase::DeleteCluster { conf };
                st.enter(StreamStatus::DeleteCluster, phase.clone(), meta.from);
                debug!(stream = %stream, user = %user, "Deleting stream cluster");
                effects.push(Effect::run_phase(phase));
                effects
            }
            StreamStatus::DeleteCluster => {
                // A delete is already under way; answer immediately.
                reply_to(meta, ClientReply::StreamDeleted { size: 0 })
            }
            _ => {
                // Restarts queued before the delete would only revive
                // processes the delete is about to kill.
                st.pending_cmds
                    .retain(|pending| !matches!(pending.cmd, Command::Down { .. }));
                enqueue_pending(
                    st,
                    &stream,
                    meta.from,
                    Command::DeleteCluster {
                        stream: stream.clone(),
                        user,
                    },
                    self.config.max_pending_cmds,
                );
                Vec::new()
            }
        }
    }

    fn handle_start_replica(
        &mut self,
        meta: &CommandMeta,
        stream: StreamId,
        node: NodeId,
        retries: u32,
    ) -> Vec<Effect> {
        let Some(st) = self.streams.get_mut(&stream) else {
            return reply_to(meta, ClientReply::Error(ErrorReply::NotFound));
        };

        if !st.status.is_running() {
            enqueue_pending(
                st,
                &stream,
                meta.from,
                Command::StartReplica {
                    stream: stream.clone(),
                    node,
                    retries,
                },
                self.config.max_pending_cmds,
            );
            return Vec::new();
        }

        if node == st.conf.leader_node {
            // The node already participates as the writer host.
            return reply_to(meta, ClientReply::Ok);
        }

        let hosts_live_replica = st.conf.replica_handles.iter().any(|h| h.node == node);
        if !hosts_live_replica {
            st.pending_replicas.insert(node.clone());
        }

        // Client-submitted starts are StartReplica; system-generated ones
        // (crash recovery, scheduled retries) are ReplicaRestart.
        let status = if meta.from.is_some() {
            StreamStatus::StartReplica
        } else {
            StreamStatus::ReplicaRestart
        };
        let phase = Phase::StartReplica {
            node,
            conf: st.conf.clone(),
            retries,
        };
        st.enter(status, phase.clone(), meta.from);
        vec![Effect::run_phase(phase)]
    }

    fn handle_delete_replica(
        &mut self,
        meta: &CommandMeta,
        stream: StreamId,
        node: NodeId,
    ) -> Vec<Effect> {
        let Some(st) = self.streams.get_mut(&stream) else {
            return reply_to(meta, ClientReply::Error(ErrorReply::NotFound));
        };

        if !st.status.is_running() {
            enqueue_pending(
                st,
                &stream,
                meta.from,
                Command::DeleteReplica {
                    stream: stream.clone(),
                    node,
                },
                self.config.max_pending_cmds,
            );
            return Vec::new();
        }

        let mut effects = Vec::new();
        let mut conf = st.conf.clone();
        conf.replica_nodes.retain(|n| n != &node);
        let dropped: Vec<Handle> = conf
            .replica_handles
            .iter()
            .filter(|h| h.node == node)
            .cloned()
            .collect();
        conf.remove_replica_handle_on(&node);
        for handle in dropped {
            self.monitors.remove_process(&handle);
            effects.push(Effect::Demonitor(handle));
        }

        st.conf = conf.clone();
        st.pending_replicas.remove(&node);
        let phase = Phase::DeleteReplica { node, conf };
        st.enter(StreamStatus::DeleteReplica, phase.clone(), meta.from);
        effects.push(Effect::run_phase(phase));
        effects
    }

    fn handle_down(&mut self, handle: Handle, reason: DownReason) -> Vec<Effect> {
        if let Some(streams) = self.monitors.subscriptions(&handle).cloned() {
            self.monitors.take(&handle);
            for stream in streams {
                if let Some(st) = self.streams.get_mut(&stream) {
                    st.subscribers.remove(&handle);
                }
            }
            return Vec::new();
        }

        let Some((stream, role)) = self.monitors.process(&handle).cloned() else {
            // Unknown or already-replaced handle.
            return Vec::new();
        };

        let Some(st) = self.streams.get_mut(&stream) else {
            self.monitors.remove_process(&handle);
            return Vec::new();
        };
        if st.status == StreamStatus::DeleteCluster {
            self.monitors.remove_process(&handle);
            return Vec::new();
        }

        match role {
            Role::Leader => {
                if st.conf.leader_handle.as_ref() != Some(&handle) {
                    self.monitors.remove_process(&handle);
                    return Vec::new();
                }
                if !st.status.is_running() {
                    enqueue_pending(
                        st,
                        &stream,
                        None,
                        Command::Down { handle, reason },
                        self.config.max_pending_cmds,
                    );
                    return Vec::new();
                }

                warn!(stream = %stream, leader = %handle, ?reason, "Stream leader down, starting election");
                self.monitors.remove_process(&handle);
                st.conf.leader_handle = None;

                let mut effects = Vec::new();
                for subscriber in &st.subscribers {
                    effects.push(Effect::SendMsg {
                        to: subscriber.clone(),
                        event: StreamEvent::LeaderDown {
                            stream: stream.clone(),
                            reference: st.conf.reference.clone(),
                            leader: Some(handle.clone()),
                        },
                    });
                }
                let phase = Phase::StopReplicas {
                    conf: st.conf.clone(),
                };
                st.enter(StreamStatus::LeaderElection, phase.clone(), None);
                effects.push(Effect::run_phase(phase));
                effects
            }
            Role::Follower => {
                let leader_alive = st
                    .conf
                    .leader_handle
                    .as_ref()
                    .is_some_and(|h| self.monitors.is_live_process(h));

                if !st.status.is_running() || !leader_alive {
                    // An election is pending; the restart replays after it
                    // completes.
                    enqueue_pending(
                        st,
                        &stream,
                        None,
                        Command::Down { handle, reason },
                        self.config.max_pending_cmds,
                    );
                    return Vec::new();
                }

                self.monitors.remove_process(&handle);
                let node = handle.node.clone();
                st.conf.replica_handles.retain(|h| h != &handle);
                if node == st.conf.leader_node {
                    // A stale replica process on the promoted node; nothing
                    // to restart there.
                    return Vec::new();
                }

                debug!(stream = %stream, replica = %handle, ?reason, "Replica down, scheduling restart");
                st.pending_replicas.insert(node.clone());
                let phase = Phase::StartReplica {
                    node,
                    conf: st.conf.clone(),
                    retries: 1,
                };
                st.enter(StreamStatus::ReplicaRestart, phase.clone(), None);
                vec![Effect::run_phase(phase)]
            }
        }
    }

    // -- internal commands (phase replies) -------------------------------

    fn handle_start_cluster_reply(
        &mut self,
        stream: StreamId,
        result: std::result::Result<StreamConfig, String>,
    ) -> Vec<Effect> {
        let Some(st) = self.streams.get_mut(&stream) else {
            return Vec::new();
        };
        if st.status != StreamStatus::StartCluster {
            debug!(stream = %stream, "Ignoring stale start_cluster reply");
            return Vec::new();
        }

        match result {
            Ok(conf) => {
                st.conf = conf.clone();
                let mut effects = Vec::new();
                if let Some(leader) = &conf.leader_handle {
                    self.monitors
                        .insert_process(leader.clone(), stream.clone(), Role::Leader);
                    effects.push(Effect::Monitor(leader.clone()));
                    for subscriber in &st.subscribers {
                        effects.push(Effect::SendMsg {
                            to: subscriber.clone(),
                            event: StreamEvent::LeaderUp {
                                stream: stream.clone(),
                                reference: conf.reference.clone(),
                                leader: leader.clone(),
                            },
                        });
                    }
                }
                for replica in &conf.replica_handles {
                    self.monitors
                        .insert_process(replica.clone(), stream.clone(), Role::Follower);
                    effects.push(Effect::Monitor(replica.clone()));
                }
                let phase = Phase::RepairRegistry {
                    repair: RegistryRepair::New,
                    conf,
                };
                st.continue_with(phase.clone());
                effects.push(Effect::run_phase(phase));
                effects
            }
            Err(reason) => {
                // The phase reported a failure it could name. Keep the
                // stream in creation and run the phase again.
                warn!(stream = %stream, reason = %reason, "Cluster start failed, rescheduling");
                let phase = Phase::StartCluster {
                    conf: st.conf.clone(),
                };
                st.continue_with(phase.clone());
                vec![Effect::run_phase(phase)]
            }
        }
    }

    fn handle_start_replica_reply(&mut self, handle: Handle, conf: StreamConfig) -> Vec<Effect> {
        let stream = conf.name.clone();
        let Some(st) = self.streams.get_mut(&stream) else {
            return Vec::new();
        };
        if !matches!(
            st.status,
            StreamStatus::StartReplica | StreamStatus::ReplicaRestart
        ) {
            debug!(stream = %stream, "Ignoring stale start_replica reply");
            return Vec::new();
        }

        st.conf = conf.clone();
        st.pending_replicas.remove(&handle.node);
        self.monitors
            .insert_process(handle.clone(), stream, Role::Follower);

        let phase = Phase::RepairRegistry {
            repair: RegistryRepair::Update,
            conf,
        };
        st.continue_with(phase.clone());
        vec![Effect::Monitor(handle), Effect::run_phase(phase)]
    }

    fn handle_start_replica_failed(
        &mut self,
        stream: StreamId,
        node: NodeId,
        retries: u32,
        reason: String,
    ) -> Vec<Effect> {
        let Some(st) = self.streams.get_mut(&stream) else {
            return Vec::new();
        };
        if !matches!(
            st.status,
            StreamStatus::StartReplica | StreamStatus::ReplicaRestart
        ) {
            return Vec::new();
        }

        warn!(
            stream = %stream,
            node = %node,
            retries,
            reason = %reason,
            "Replica start failed, scheduling retry"
        );
        st.pending_replicas.insert(node.clone());

        let mut effects = Vec::new();
        if let Some(to) = st.reply_to {
            effects.push(Effect::reply(
                to,
                ClientReply::Error(ErrorReply::ReplicaStartFailed {
                    node: node.clone(),
                    reason,
                }),
            ));
        }
        effects.extend(pipeline(st.finish()));
        effects.push(Effect::DelayedCmd {
            delay: self.config.restart_delay(retries),
            cmd: Command::StartReplica {
                stream,
                node,
                retries: retries + 1,
            },
        });
        effects
    }

    fn handle_delete_cluster_reply(&mut self, stream: StreamId, size: u64) -> Vec<Effect> {
        let Some(st) = self.streams.remove(&stream) else {
            return Vec::new();
        };

        let mut effects = Vec::new();
        if let Some(to) = st.reply_to {
            effects.push(Effect::reply(to, ClientReply::StreamDeleted { size }));
        }
        for subscriber in &st.subscribers {
            effects.push(Effect::SendMsg {
                to: subscriber.clone(),
                event: StreamEvent::StreamDeleted {
                    stream: stream.clone(),
                    reference: st.conf.reference.clone(),
                },
            });
            if self.monitors.unsubscribe(subscriber, &stream) {
                effects.push(Effect::Demonitor(subscriber.clone()));
            }
        }
        debug!(stream = %stream, size, "Stream cluster deleted");
        effects
    }

    fn handle_phase_finished(&mut self, stream: StreamId, reply: ClientReply) -> Vec<Effect> {
        let Some(st) = self.streams.get_mut(&stream) else {
            return Vec::new();
        };
        // Only registry repairs and replica starts complete this way; a
        // duplicate from a resumed phase finds the stream running (or in a
        // later phase) and is dropped.
        if !matches!(
            st.phase,
            Some(Phase::RepairRegistry { .. }) | Some(Phase::StartReplica { .. })
        ) {
            return Vec::new();
        }

        if let Some(Phase::StartReplica { node, .. }) = &st.phase {
            let node = node.clone();
            st.pending_replicas.remove(&node);
        }

        let mut effects = Vec::new();
        if let Some(to) = st.reply_to {
            effects.push(Effect::reply(to, reply));
        }
        effects.extend(pipeline(st.finish()));
        effects
    }

    fn handle_stream_updated(&mut self, conf: StreamConfig) -> Vec<Effect> {
        let stream = conf.name.clone();
        let Some(st) = self.streams.get_mut(&stream) else {
            return Vec::new();
        };
        if st.status.is_running() {
            debug!(stream = %stream, "Ignoring stale stream_updated");
            return Vec::new();
        }

        st.conf = conf.clone();
        let phase = Phase::RepairRegistry {
            repair: RegistryRepair::Update,
            conf,
        };
        st.continue_with(phase.clone());
        vec![Effect::run_phase(phase)]
    }

    fn handle_replicas_stopped(&mut self, stream: StreamId) -> Vec<Effect> {
        let Some(st) = self.streams.get_mut(&stream) else {
            return Vec::new();
        };
        if st.status != StreamStatus::LeaderElection
            || !matches!(st.phase, Some(Phase::StopReplicas { .. }))
        {
            return Vec::new();
        }

        let phase = Phase::CheckQuorum {
            conf: st.conf.clone(),
        };
        st.continue_with(phase.clone());
        vec![Effect::run_phase(phase)]
    }

    fn handle_start_leader_election(
        &mut self,
        stream: StreamId,
        new_epoch: u64,
        tails: Vec<(NodeId, LogTail)>,
    ) -> Vec<Effect> {
        let Some(st) = self.streams.get_mut(&stream) else {
            return Vec::new();
        };
        if st.status != StreamStatus::LeaderElection
            || !matches!(st.phase, Some(Phase::CheckQuorum { .. }))
        {
            return Vec::new();
        }
        if new_epoch != st.conf.epoch + 1 {
            debug!(stream = %stream, new_epoch, epoch = st.conf.epoch, "Ignoring stale election");
            return Vec::new();
        }
        let Some(new_leader) = select_leader(&tails) else {
            return Vec::new();
        };

        let mut effects = Vec::new();
        let old_leader = st.conf.leader_node.clone();
        st.conf.epoch = new_epoch;

        if new_leader != old_leader {
            st.conf.replica_nodes.retain(|n| n != &new_leader);
            st.conf.replica_nodes.push(old_leader.clone());
            st.conf.leader_node = new_leader.clone();

            // The promoted node's replica process is being replaced by the
            // writer; drop its stale handle outright.
            let stale: Vec<Handle> = st
                .conf
                .replica_handles
                .iter()
                .filter(|h| h.node == new_leader)
                .cloned()
                .collect();
            st.conf.remove_replica_handle_on(&new_leader);
            for handle in stale {
                self.monitors.remove_process(&handle);
                effects.push(Effect::Demonitor(handle));
            }

            // The old leader node rejoins as a replica once it is back.
            st.pending_replicas.insert(old_leader.clone());
            st.pending_cmds.push_back(PendingCmd {
                from: None,
                cmd: Command::StartReplica {
                    stream: stream.clone(),
                    node: old_leader,
                    retries: 1,
                },
            });
        }

        debug!(
            stream = %stream,
            epoch = new_epoch,
            leader = %st.conf.leader_node,
            "Elected new stream leader"
        );
        let phase = Phase::StartNewLeader {
            conf: st.conf.clone(),
        };
        st.continue_with(phase.clone());
        effects.push(Effect::run_phase(phase));
        effects
    }

    fn handle_leader_elected(&mut self, conf: StreamConfig) -> Vec<Effect> {
        let stream = conf.name.clone();
        let Some(st) = self.streams.get_mut(&stream) else {
            return Vec::new();
        };
        if st.status != StreamStatus::LeaderElection
            || !matches!(st.phase, Some(Phase::StartNewLeader { .. }))
        {
            return Vec::new();
        }
        if conf.epoch != st.conf.epoch {
            debug!(stream = %stream, "Ignoring leader_elected for stale epoch");
            return Vec::new();
        }
        if conf.leader_handle.is_some() && st.conf.leader_handle == conf.leader_handle {
            // Duplicate delivery from a resumed phase.
            return Vec::new();
        }

        st.conf = conf.clone();
        let mut effects = Vec::new();
        if let Some(leader) = &conf.leader_handle {
            self.monitors
                .insert_process(leader.clone(), stream.clone(), Role::Leader);
            effects.push(Effect::Monitor(leader.clone()));
            for subscriber in &st.subscribers {
                effects.push(Effect::SendMsg {
                    to: subscriber.clone(),
                    event: StreamEvent::LeaderUp {
                        stream: stream.clone(),
                        reference: conf.reference.clone(),
                        leader: leader.clone(),
                    },
                });
            }
        }
        metrics::ELECTIONS.inc();

        let phase = Phase::RepairRegistry {
            repair: RegistryRepair::Update,
            conf,
        };
        st.continue_with(phase.clone());
        effects.push(Effect::run_phase(phase));
        effects
    }

    /// Diagnostic check of the replicated-state invariants. Returns every
    /// violation found; used by tests and debug assertions.
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for (id, st) in &self.streams {
            let running = st.status.is_running();
            if running && (st.phase.is_some() || st.reply_to.is_some()) {
                violations.push(format!("{id}: running with phase or reply_to set"));
            }
            if !running && st.phase.is_none() {
                violations.push(format!("{id}: non-running without a phase"));
            }
            if running && !st.pending_cmds.is_empty() {
                violations.push(format!("{id}: running with pending commands"));
            }
            if st.conf.replica_nodes.contains(&st.conf.leader_node) {
                violations.push(format!("{id}: leader node in replica set"));
            }
            for node in &st.pending_replicas {
                if st.conf.replica_handles.iter().any(|h| &h.node == node) {
                    violations.push(format!("{id}: pending replica {node} already live"));
                }
            }
        }
        violations
    }
}

fn reply_to(meta: &CommandMeta, reply: ClientReply) -> Vec<Effect> {
    match meta.from {
        Some(to) => vec![Effect::reply(to, reply)],
        None => Vec::new(),
    }
}

fn enqueue_pending(
    st: &mut StreamState,
    stream: &StreamId,
    from: Option<ReplyTo>,
    cmd: Command,
    max_pending: usize,
) {
    if st.pending_cmds.len() >= max_pending {
        warn!(stream = %stream, command = cmd.name(), "Pending queue full, dropping command");
        return;
    }
    st.pending_cmds.push_back(PendingCmd { from, cmd });
}

fn pipeline(drained: Vec<PendingCmd>) -> Option<Effect> {
    if drained.is_empty() {
        None
    } else {
        Some(Effect::Aux(AuxRequest::Pipeline { cmds: drained }))
    }
}
