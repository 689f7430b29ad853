//! In-memory test doubles for the coordinator's collaborators.
//!
//! Used by this crate's unit and integration tests and exported for
//! downstream crates embedding the coordinator. Every mock is scriptable:
//! failures are queued per operation and consumed in order, so a test can
//! make exactly the second call fail.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CoordinatorError, Result};
use crate::types::{Handle, LogTail, NodeId, ReplyTo, StreamId};

use super::commands::{ClientReply, Command};
use super::stream::StreamConfig;
use super::traits::{
    ClusterStart, ConsensusClient, LogEngine, LogOverview, NodeMembership, NodeSelector,
    ReplicaStart, StartupLock, StopOutcome, StreamRegistry, UpdateOutcome, WriterStart,
};

/// Scriptable in-memory log engine.
#[derive(Default)]
pub struct MockLogEngine {
    handle_seq: AtomicU64,
    inner: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    /// Queued failures per operation name, consumed in order.
    failures: BTreeMap<&'static str, VecDeque<String>>,
    /// Nodes that refuse connections.
    down_nodes: BTreeSet<NodeId>,
    /// Nodes that already hold replica data.
    present_replicas: BTreeSet<NodeId>,
    /// Running replica processes by node.
    running_replicas: BTreeMap<NodeId, Handle>,
    /// Running writer processes by stream.
    running_writers: BTreeMap<StreamId, Handle>,
    /// Log tails reported by `log_overview`, by node.
    log_tails: BTreeMap<NodeId, LogTail>,
    /// Committed sizes reported by `delete_cluster`, by stream.
    stream_sizes: BTreeMap<StreamId, u64>,
    /// Every operation performed, as `"op node"` strings.
    calls: Vec<String>,
}

impl MockLogEngine {
    /// Queue a failure for the next call of `op`.
    pub fn fail_next(&self, op: &'static str, reason: &str) {
        let mut inner = self.inner.lock().expect("engine lock");
        inner
            .failures
            .entry(op)
            .or_default()
            .push_back(reason.to_string());
    }

    pub fn set_node_down(&self, node: &NodeId) {
        self.inner
            .lock()
            .expect("engine lock")
            .down_nodes
            .insert(node.clone());
    }

    pub fn set_node_up(&self, node: &NodeId) {
        self.inner
            .lock()
            .expect("engine lock")
            .down_nodes
            .remove(node);
    }

    pub fn set_replica_present(&self, node: &NodeId) {
        self.inner
            .lock()
            .expect("engine lock")
            .present_replicas
            .insert(node.clone());
    }

    pub fn set_log_tail(&self, node: &NodeId, tail: LogTail) {
        self.inner
            .lock()
            .expect("engine lock")
            .log_tails
            .insert(node.clone(), tail);
    }

    pub fn set_stream_size(&self, stream: &StreamId, size: u64) {
        self.inner
            .lock()
            .expect("engine lock")
            .stream_sizes
            .insert(stream.clone(), size);
    }

    /// Every operation performed so far, as `"op node"` strings.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().expect("engine lock").calls.clone()
    }

    /// Simulate the writer process of `stream` dying.
    pub fn kill_writer(&self, stream: &StreamId) -> Option<Handle> {
        self.inner
            .lock()
            .expect("engine lock")
            .running_writers
            .remove(stream)
    }

    /// Simulate the replica process on `node` dying.
    pub fn kill_replica(&self, node: &NodeId) -> Option<Handle> {
        self.inner
            .lock()
            .expect("engine lock")
            .running_replicas
            .remove(node)
    }

    fn next_handle(&self, node: &NodeId) -> Handle {
        Handle::new(
            node.clone(),
            1_000 + self.handle_seq.fetch_add(1, Ordering::SeqCst),
        )
    }

    fn take_failure(inner: &mut EngineState, op: &'static str) -> Option<String> {
        inner.failures.get_mut(op).and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl LogEngine for MockLogEngine {
    async fn start_cluster(&self, conf: &StreamConfig) -> Result<ClusterStart> {
        let leader = self.next_handle(&conf.leader_node);
        let replicas: Vec<Handle> = conf
            .replica_nodes
            .iter()
            .map(|n| self.next_handle(n))
            .collect();

        let mut inner = self.inner.lock().expect("engine lock");
        inner.calls.push(format!("start_cluster {}", conf.name));
        if let Some(reason) = Self::take_failure(&mut inner, "start_cluster") {
            return Err(CoordinatorError::Engine(reason));
        }

        let mut started = conf.clone();
        started.leader_handle = Some(leader.clone());
        started.replica_handles = replicas.clone();
        inner
            .running_writers
            .insert(conf.name.clone(), leader);
        for handle in replicas {
            inner.running_replicas.insert(handle.node.clone(), handle);
        }
        Ok(ClusterStart::Started { conf: started })
    }

    async fn delete_cluster(&self, conf: &StreamConfig) -> Result<u64> {
        let mut inner = self.inner.lock().expect("engine lock");
        inner.calls.push(format!("delete_cluster {}", conf.name));
        if let Some(reason) = Self::take_failure(&mut inner, "delete_cluster") {
            return Err(CoordinatorError::Engine(reason));
        }
        inner.running_writers.remove(&conf.name);
        for node in &conf.replica_nodes {
            inner.running_replicas.remove(node);
        }
        Ok(inner.stream_sizes.get(&conf.name).copied().unwrap_or(0))
    }

    async fn start_replica(&self, node: &NodeId, conf: &StreamConfig) -> Result<ReplicaStart> {
        let handle = self.next_handle(node);
        let mut inner = self.inner.lock().expect("engine lock");
        inner
            .calls
            .push(format!("start_replica {} {}", conf.name, node));
        if let Some(reason) = Self::take_failure(&mut inner, "start_replica") {
            return Err(CoordinatorError::Engine(reason));
        }
        if inner.down_nodes.contains(node) {
            return Err(CoordinatorError::NodeDown(node.clone()));
        }
        if let Some(existing) = inner.running_replicas.get(node) {
            return Ok(ReplicaStart::AlreadyStarted(existing.clone()));
        }
        if inner.present_replicas.contains(node) {
            return Ok(ReplicaStart::AlreadyPresent);
        }
        inner.running_replicas.insert(node.clone(), handle.clone());
        Ok(ReplicaStart::Started(handle))
    }

    async fn stop_replica(&self, node: &NodeId, conf: &StreamConfig) -> Result<StopOutcome> {
        let mut inner = self.inner.lock().expect("engine lock");
        inner
            .calls
            .push(format!("stop_replica {} {}", conf.name, node));
        if let Some(reason) = Self::take_failure(&mut inner, "stop_replica") {
            return Err(CoordinatorError::Engine(reason));
        }
        if inner.down_nodes.contains(node) {
            return Ok(StopOutcome::NodeDown);
        }
        inner.running_replicas.remove(node);
        Ok(StopOutcome::Stopped)
    }

    async fn delete_replica(&self, node: &NodeId, conf: &StreamConfig) -> Result<()> {
        let mut inner = self.inner.lock().expect("engine lock");
        inner
            .calls
            .push(format!("delete_replica {} {}", conf.name, node));
        if let Some(reason) = Self::take_failure(&mut inner, "delete_replica") {
            return Err(CoordinatorError::Engine(reason));
        }
        inner.running_replicas.remove(node);
        inner.present_replicas.remove(node);
        Ok(())
    }

    async fn start_writer(&self, conf: &StreamConfig) -> Result<WriterStart> {
        let handle = self.next_handle(&conf.leader_node);
        let mut inner = self.inner.lock().expect("engine lock");
        inner.calls.push(format!("start_writer {}", conf.name));
        if let Some(reason) = Self::take_failure(&mut inner, "start_writer") {
            return Err(CoordinatorError::Engine(reason));
        }
        if let Some(existing) = inner.running_writers.get(&conf.name) {
            return Ok(WriterStart::AlreadyStarted(existing.clone()));
        }
        inner
            .running_writers
            .insert(conf.name.clone(), handle.clone());
        Ok(WriterStart::Started(handle))
    }

    async fn log_overview(&self, node: &NodeId, _dir: &str) -> Result<Option<LogOverview>> {
        let inner = self.inner.lock().expect("engine lock");
        if inner.down_nodes.contains(node) {
            return Err(CoordinatorError::NodeDown(node.clone()));
        }
        Ok(inner.log_tails.get(node).map(|tail| match tail {
            LogTail::Empty => LogOverview {
                range: (0, 0),
                epoch_offsets: vec![],
            },
            LogTail::At { offset, epoch } => LogOverview {
                range: (0, *offset),
                epoch_offsets: vec![(*offset, *epoch)],
            },
        }))
    }
}

/// In-memory durable topology registry.
#[derive(Default)]
pub struct MockRegistry {
    inner: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    records: BTreeMap<StreamId, StreamConfig>,
    failures: BTreeMap<&'static str, VecDeque<String>>,
}

impl MockRegistry {
    pub fn fail_next(&self, op: &'static str, reason: &str) {
        let mut inner = self.inner.lock().expect("registry lock");
        inner
            .failures
            .entry(op)
            .or_default()
            .push_back(reason.to_string());
    }

    pub fn seed(&self, conf: StreamConfig) {
        let mut inner = self.inner.lock().expect("registry lock");
        inner.records.insert(conf.name.clone(), conf);
    }

    pub fn contains(&self, name: &StreamId) -> bool {
        self.inner
            .lock()
            .expect("registry lock")
            .records
            .contains_key(name)
    }

    pub fn get(&self, name: &StreamId) -> Option<StreamConfig> {
        self.inner
            .lock()
            .expect("registry lock")
            .records
            .get(name)
            .cloned()
    }

    fn take_failure(&self, op: &'static str) -> Option<String> {
        self.inner
            .lock()
            .expect("registry lock")
            .failures
            .get_mut(op)
            .and_then(|q| q.pop_front())
    }
}

#[async_trait]
impl StreamRegistry for MockRegistry {
    async fn declare(&self, conf: &StreamConfig) -> Result<()> {
        if let Some(reason) = self.take_failure("declare") {
            return Err(CoordinatorError::Registry(reason));
        }
        self.inner
            .lock()
            .expect("registry lock")
            .records
            .insert(conf.name.clone(), conf.clone());
        Ok(())
    }

    async fn update(&self, name: &StreamId, conf: &StreamConfig) -> Result<UpdateOutcome> {
        if let Some(reason) = self.take_failure("update") {
            return Err(CoordinatorError::Registry(reason));
        }
        let mut inner = self.inner.lock().expect("registry lock");
        if inner.records.contains_key(name) {
            inner.records.insert(name.clone(), conf.clone());
            Ok(UpdateOutcome::Updated)
        } else {
            Ok(UpdateOutcome::Missing)
        }
    }

    async fn delete(&self, name: &StreamId, _user: &str) -> Result<()> {
        if let Some(reason) = self.take_failure("delete") {
            return Err(CoordinatorError::Registry(reason));
        }
        self.inner
            .lock()
            .expect("registry lock")
            .records
            .remove(name);
        Ok(())
    }
}

/// Static fleet membership.
#[derive(Default)]
pub struct MockMembership {
    inner: Mutex<MembershipState>,
}

#[derive(Default)]
struct MembershipState {
    all: Vec<NodeId>,
    running: Vec<NodeId>,
    dead_handles: BTreeSet<Handle>,
}

impl MockMembership {
    pub fn new(all: Vec<NodeId>, running: Vec<NodeId>) -> Self {
        Self {
            inner: Mutex::new(MembershipState {
                all,
                running,
                dead_handles: BTreeSet::new(),
            }),
        }
    }

    pub fn set_nodes(&self, all: Vec<NodeId>, running: Vec<NodeId>) {
        let mut inner = self.inner.lock().expect("membership lock");
        inner.all = all;
        inner.running = running;
    }

    pub fn mark_dead(&self, handle: Handle) {
        self.inner
            .lock()
            .expect("membership lock")
            .dead_handles
            .insert(handle);
    }
}

#[async_trait]
impl NodeMembership for MockMembership {
    async fn cluster_nodes(&self, selector: NodeSelector) -> Result<Vec<NodeId>> {
        let inner = self.inner.lock().expect("membership lock");
        Ok(match selector {
            NodeSelector::All => inner.all.clone(),
            NodeSelector::Running => inner.running.clone(),
        })
    }

    async fn is_alive(&self, handle: &Handle) -> Result<bool> {
        Ok(!self
            .inner
            .lock()
            .expect("membership lock")
            .dead_handles
            .contains(handle))
    }
}

/// Recording consensus client. Submitted commands are captured for the
/// test to apply; membership operations mutate an in-memory member set.
#[derive(Default)]
pub struct MockConsensus {
    inner: Mutex<ConsensusState>,
}

#[derive(Default)]
struct ConsensusState {
    members: BTreeSet<NodeId>,
    started_members: Vec<NodeId>,
    submitted: Vec<(Option<ReplyTo>, Command)>,
    submit_failures: VecDeque<String>,
}

impl MockConsensus {
    pub fn with_members(members: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            inner: Mutex::new(ConsensusState {
                members: members.into_iter().collect(),
                ..ConsensusState::default()
            }),
        }
    }

    pub fn fail_next_submit(&self, reason: &str) {
        self.inner
            .lock()
            .expect("consensus lock")
            .submit_failures
            .push_back(reason.to_string());
    }

    /// Drain every command submitted so far.
    pub fn take_submitted(&self) -> Vec<(Option<ReplyTo>, Command)> {
        std::mem::take(&mut self.inner.lock().expect("consensus lock").submitted)
    }

    pub fn member_set(&self) -> BTreeSet<NodeId> {
        self.inner.lock().expect("consensus lock").members.clone()
    }

    pub fn started_members(&self) -> Vec<NodeId> {
        self.inner
            .lock()
            .expect("consensus lock")
            .started_members
            .clone()
    }
}

#[async_trait]
impl ConsensusClient for MockConsensus {
    async fn submit(&self, cmd: Command) -> Result<ClientReply> {
        let mut inner = self.inner.lock().expect("consensus lock");
        if let Some(reason) = inner.submit_failures.pop_front() {
            return Err(CoordinatorError::Consensus(reason));
        }
        inner.submitted.push((None, cmd));
        Ok(ClientReply::Ok)
    }

    async fn resubmit(&self, from: Option<ReplyTo>, cmd: Command) -> Result<()> {
        let mut inner = self.inner.lock().expect("consensus lock");
        if let Some(reason) = inner.submit_failures.pop_front() {
            return Err(CoordinatorError::Consensus(reason));
        }
        inner.submitted.push((from, cmd));
        Ok(())
    }

    async fn members(&self) -> Result<Vec<NodeId>> {
        Ok(self
            .inner
            .lock()
            .expect("consensus lock")
            .members
            .iter()
            .cloned()
            .collect())
    }

    async fn start_member(&self, node: &NodeId) -> Result<()> {
        self.inner
            .lock()
            .expect("consensus lock")
            .started_members
            .push(node.clone());
        Ok(())
    }

    async fn add_member(&self, node: &NodeId) -> Result<()> {
        self.inner
            .lock()
            .expect("consensus lock")
            .members
            .insert(node.clone());
        Ok(())
    }

    async fn remove_member(&self, node: &NodeId) -> Result<()> {
        self.inner
            .lock()
            .expect("consensus lock")
            .members
            .remove(node);
        Ok(())
    }
}

/// In-memory leased lock.
#[derive(Default)]
pub struct MockStartupLock {
    held: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl StartupLock for MockStartupLock {
    async fn acquire(&self, name: &str, _lease: Duration) -> Result<bool> {
        Ok(self.held.lock().expect("lock state").insert(name.to_string()))
    }

    async fn release(&self, name: &str) -> Result<()> {
        self.held.lock().expect("lock state").remove(name);
        Ok(())
    }
}
