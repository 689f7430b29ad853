//! End-to-end lifecycle scenarios.
//!
//! These tests drive the real state machine and the real phase
//! implementations against the in-memory collaborators, interpreting the
//! machine's effects the way the consensus layer would: replies and
//! subscriber messages are collected, phases execute to completion and
//! their result commands feed back into `apply`, drained pending commands
//! re-enter the loop with their original reply tokens. Replicated-state
//! invariants are checked after every applied command.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rivulet::config::CoordinatorConfig;
use rivulet::coordinator::testing::{MockConsensus, MockLogEngine, MockMembership, MockRegistry};
use rivulet::coordinator::{
    AuxRequest, ClientReply, Command, CommandMeta, DownReason, Effect, ErrorReply, Phase,
    PhaseContext, RaftRole, StreamCoordinator, StreamEvent, StreamSpec, StreamStatus, phases,
};
use rivulet::types::{Handle, LogTail, NodeId, ReplyTo, StreamId};

fn sid(s: &str) -> StreamId {
    Arc::from(s)
}

fn node(s: &str) -> NodeId {
    Arc::from(s)
}

fn spec(name: &str) -> StreamSpec {
    StreamSpec {
        name: sid(name),
        reference: format!("queue/{name}"),
        leader_node: node("n1"),
        replica_nodes: vec![node("n2"), node("n3")],
        dir: format!("/data/{name}"),
    }
}

/// Test stand-in for the consensus layer's effect interpreter.
struct Harness {
    machine: StreamCoordinator,
    ctx: Arc<PhaseContext>,
    engine: Arc<MockLogEngine>,
    registry: Arc<MockRegistry>,
    next_token: ReplyTo,
    index: u64,
    /// Replies addressed to originators.
    replies: Vec<(ReplyTo, ClientReply)>,
    /// Messages sent to subscribers.
    events: Vec<(Handle, StreamEvent)>,
    /// Timer-scheduled commands, not yet fired.
    delayed: VecDeque<(Duration, Command)>,
    /// Phases that terminated abnormally, awaiting an executor respawn.
    failed_phases: Vec<Phase>,
    /// Phase name to capture instead of running (simulates a phase still
    /// in flight when coordinator leadership moves).
    pause_on: Option<&'static str>,
    paused_phases: Vec<Phase>,
}

impl Harness {
    fn new() -> Self {
        let engine = Arc::new(MockLogEngine::default());
        let registry = Arc::new(MockRegistry::default());
        let ctx = Arc::new(PhaseContext {
            engine: engine.clone(),
            registry: registry.clone(),
            membership: Arc::new(MockMembership::default()),
            consensus: Arc::new(MockConsensus::default()),
        });
        Self {
            machine: StreamCoordinator::new(CoordinatorConfig::default()),
            ctx,
            engine,
            registry,
            next_token: 1,
            index: 0,
            replies: Vec::new(),
            events: Vec::new(),
            delayed: VecDeque::new(),
            failed_phases: Vec::new(),
            pause_on: None,
            paused_phases: Vec::new(),
        }
    }

    /// Submit a client command; returns its reply token.
    async fn submit(&mut self, cmd: Command) -> ReplyTo {
        let token = self.next_token;
        self.next_token += 1;
        self.drive(Some(token), cmd).await;
        token
    }

    /// Apply a system-generated command (down notification, timer).
    async fn inject(&mut self, cmd: Command) {
        self.drive(None, cmd).await;
    }

    /// Fire the oldest scheduled delayed command.
    async fn fire_delayed(&mut self) -> Duration {
        let (delay, cmd) = self.delayed.pop_front().expect("a delayed command");
        self.drive(None, cmd).await;
        delay
    }

    /// Respawn the oldest failed phase, the way the executor would: a
    /// failed start_new_leader restarts from check_quorum.
    async fn respawn_failed(&mut self) {
        let phase = self.failed_phases.remove(0);
        let phase = match phase {
            Phase::StartNewLeader { conf } => Phase::CheckQuorum { conf },
            other => other,
        };
        self.run_phase(phase).await;
    }

    /// Run one phase and feed its result command back into the machine.
    async fn run_phase(&mut self, phase: Phase) {
        match phases::run(phase.clone(), self.ctx.clone()).await {
            Ok(cmd) => self.drive(None, cmd).await,
            Err(_) => self.failed_phases.push(phase),
        }
    }

    async fn drive(&mut self, from: Option<ReplyTo>, cmd: Command) {
        let mut queue: VecDeque<(Option<ReplyTo>, Command)> = VecDeque::from([(from, cmd)]);
        while let Some((from, cmd)) = queue.pop_front() {
            self.index += 1;
            let meta = CommandMeta {
                index: self.index,
                term: 1,
                from,
            };
            let effects = self.machine.apply(&meta, cmd);
            let violations = self.machine.invariant_violations();
            assert!(violations.is_empty(), "invariants violated: {violations:?}");

            for effect in effects {
                match effect {
                    Effect::Aux(AuxRequest::RunPhase { phase }) => {
                        if self.pause_on == Some(phase.name()) {
                            self.paused_phases.push(phase);
                            continue;
                        }
                        match phases::run(phase.clone(), self.ctx.clone()).await {
                            Ok(cmd) => queue.push_back((None, cmd)),
                            Err(_) => self.failed_phases.push(phase),
                        }
                    }
                    Effect::Aux(AuxRequest::Pipeline { cmds }) => {
                        for pending in cmds {
                            queue.push_back((pending.from, pending.cmd));
                        }
                    }
                    Effect::Aux(AuxRequest::ReconcileMembers) => {}
                    Effect::Reply { to, reply } => self.replies.push((to, reply)),
                    Effect::SendMsg { to, event } => self.events.push((to, event)),
                    Effect::DelayedCmd { delay, cmd } => self.delayed.push_back((delay, cmd)),
                    Effect::Monitor(_) | Effect::Demonitor(_) => {}
                }
            }
        }
    }

    fn reply_for(&self, token: ReplyTo) -> Option<&ClientReply> {
        self.replies
            .iter()
            .find(|(t, _)| *t == token)
            .map(|(_, r)| r)
    }

    fn events_for(&self, subscriber: &Handle) -> Vec<&StreamEvent> {
        self.events
            .iter()
            .filter(|(to, _)| to == subscriber)
            .map(|(_, e)| e)
            .collect()
    }

    /// Create a stream and drive it to `Running`.
    async fn create(&mut self, name: &str) -> ReplyTo {
        let token = self.submit(Command::StartCluster { spec: spec(name) }).await;
        assert_eq!(
            self.machine.stream(&sid(name)).unwrap().status,
            StreamStatus::Running
        );
        token
    }

    fn leader_handle(&self, name: &str) -> Handle {
        self.machine
            .stream(&sid(name))
            .unwrap()
            .conf
            .leader_handle
            .clone()
            .expect("leader handle")
    }

    /// Kill the stream's writer process and deliver its down event.
    async fn kill_leader(&mut self, name: &str) -> Handle {
        let leader = self.leader_handle(name);
        self.engine.kill_writer(&sid(name));
        self.inject(Command::Down {
            handle: leader.clone(),
            reason: DownReason::Crashed("killed".to_string()),
        })
        .await;
        leader
    }
}

// ============================================================================
// S1 — Create + delete
// ============================================================================

#[tokio::test]
async fn create_then_delete_cluster() {
    let mut h = Harness::new();
    let token = h.create("s1").await;

    // Creation replied with the final topology.
    match h.reply_for(token) {
        Some(ClientReply::StreamStarted { conf }) => {
            assert_eq!(conf.leader_node, node("n1"));
            assert!(conf.leader_handle.is_some());
            assert_eq!(conf.replica_handles.len(), 2);
        }
        other => panic!("expected StreamStarted, got {other:?}"),
    }

    // One leader and two followers are monitored; the registry holds the
    // record.
    let st = h.machine.stream(&sid("s1")).unwrap();
    let leader = st.conf.leader_handle.clone().unwrap();
    assert!(h.machine.monitors().process(&leader).is_some());
    for replica in &st.conf.replica_handles {
        assert!(h.machine.monitors().process(replica).is_some());
    }
    assert!(h.registry.contains(&sid("s1")));

    // Delete tears everything down.
    let replicas = st.conf.replica_handles.clone();
    h.engine.set_stream_size(&sid("s1"), 42);
    let token = h
        .submit(Command::DeleteCluster {
            stream: sid("s1"),
            user: "u".to_string(),
        })
        .await;
    assert_eq!(
        h.reply_for(token),
        Some(&ClientReply::StreamDeleted { size: 42 })
    );
    assert!(h.machine.stream(&sid("s1")).is_none());
    assert!(h.machine.monitors().process(&leader).is_none());
    for replica in &replicas {
        assert!(h.machine.monitors().process(replica).is_none());
    }
    assert!(!h.registry.contains(&sid("s1")));
}

#[tokio::test]
async fn delete_unknown_stream_returns_zero() {
    let mut h = Harness::new();
    let token = h
        .submit(Command::DeleteCluster {
            stream: sid("ghost"),
            user: "u".to_string(),
        })
        .await;
    assert_eq!(
        h.reply_for(token),
        Some(&ClientReply::StreamDeleted { size: 0 })
    );
}

// ============================================================================
// S2 — Subscribe, then the leader dies
// ============================================================================

#[tokio::test]
async fn subscriber_sees_leader_down_then_new_leader_up() {
    let mut h = Harness::new();
    h.create("s1").await;
    let subscriber = Handle::new("client", 7);
    h.submit(Command::Subscribe {
        stream: sid("s1"),
        subscriber: subscriber.clone(),
    })
    .await;

    // Initial liveness announcement.
    let old_leader = h.leader_handle("s1");
    assert!(matches!(
        h.events_for(&subscriber).as_slice(),
        [StreamEvent::LeaderUp { leader, .. }] if *leader == old_leader
    ));

    // n2 has the longest log and must win the election.
    h.engine
        .set_log_tail(&node("n2"), LogTail::At { offset: 9, epoch: 1 });
    h.engine
        .set_log_tail(&node("n3"), LogTail::At { offset: 7, epoch: 1 });
    h.kill_leader("s1").await;

    let st = h.machine.stream(&sid("s1")).unwrap();
    assert_eq!(st.status, StreamStatus::Running);
    assert_eq!(st.conf.leader_node, node("n2"));
    assert_eq!(st.conf.epoch, 2);
    // The deposed leader node rejoined as a replica.
    assert!(st.conf.replica_nodes.contains(&node("n1")));

    let events = h.events_for(&subscriber);
    match events.as_slice() {
        [
            StreamEvent::LeaderUp { leader: first, .. },
            StreamEvent::LeaderDown {
                leader: Some(down), ..
            },
            StreamEvent::LeaderUp { leader: second, .. },
        ] => {
            assert_eq!(*first, old_leader);
            assert_eq!(*down, old_leader);
            assert_ne!(*second, old_leader);
            assert_eq!(second.node, node("n2"));
        }
        other => panic!("unexpected event sequence: {other:?}"),
    }
}

// ============================================================================
// S3 — Add replica with retry
// ============================================================================

#[tokio::test]
async fn failed_replica_start_retries_with_linear_backoff() {
    let mut h = Harness::new();
    h.create("s1").await;

    h.engine.fail_next("start_replica", "enoent");
    let token = h
        .submit(Command::StartReplica {
            stream: sid("s1"),
            node: node("n4"),
            retries: 1,
        })
        .await;

    // The originator sees the first failure; the stream is running again
    // with the node parked in pending_replicas and a retry scheduled.
    assert!(matches!(
        h.reply_for(token),
        Some(ClientReply::Error(ErrorReply::ReplicaStartFailed { .. }))
    ));
    let st = h.machine.stream(&sid("s1")).unwrap();
    assert_eq!(st.status, StreamStatus::Running);
    assert!(st.pending_replicas.contains(&node("n4")));

    // Second attempt succeeds.
    let delay = h.fire_delayed().await;
    assert_eq!(delay, Duration::from_millis(1_000));

    let st = h.machine.stream(&sid("s1")).unwrap();
    assert_eq!(st.status, StreamStatus::Running);
    assert!(!st.pending_replicas.contains(&node("n4")));
    assert!(st.conf.replica_nodes.contains(&node("n4")));
    assert!(st.conf.replica_handles.iter().any(|hd| hd.node == node("n4")));
    assert_eq!(h.registry.get(&sid("s1")).unwrap(), st.conf);
}

// ============================================================================
// S4 — delete_cluster supersedes pending restarts
// ============================================================================

#[tokio::test]
async fn delete_filters_queued_downs_and_no_restart_after_delete() {
    let mut h = Harness::new();
    h.create("s1").await;
    let follower = h.machine.stream(&sid("s1")).unwrap().conf.replica_handles[0].clone();

    // The election stalls at the quorum check (no node reports a log).
    h.kill_leader("s1").await;
    assert_eq!(
        h.machine.stream(&sid("s1")).unwrap().status,
        StreamStatus::LeaderElection
    );
    assert_eq!(h.failed_phases.len(), 1);

    // A follower dies while the election is pending: queued.
    h.inject(Command::Down {
        handle: follower,
        reason: DownReason::Crashed("killed".to_string()),
    })
    .await;
    assert!(
        h.machine
            .stream(&sid("s1"))
            .unwrap()
            .pending_cmds
            .iter()
            .any(|p| matches!(p.cmd, Command::Down { .. }))
    );

    // The delete supersedes the queued restart.
    let token = h
        .submit(Command::DeleteCluster {
            stream: sid("s1"),
            user: "u".to_string(),
        })
        .await;
    let pending = &h.machine.stream(&sid("s1")).unwrap().pending_cmds;
    assert!(!pending.iter().any(|p| matches!(p.cmd, Command::Down { .. })));
    assert!(
        pending
            .iter()
            .any(|p| matches!(p.cmd, Command::DeleteCluster { .. }))
    );

    // Quorum recovers; the election completes and the drained delete wins.
    h.engine
        .set_log_tail(&node("n2"), LogTail::At { offset: 9, epoch: 1 });
    h.engine
        .set_log_tail(&node("n3"), LogTail::At { offset: 7, epoch: 1 });
    h.respawn_failed().await;

    assert!(h.machine.stream(&sid("s1")).is_none());
    assert_eq!(
        h.reply_for(token),
        Some(&ClientReply::StreamDeleted { size: 0 })
    );

    // No replica was started after the cluster was deleted.
    let calls = h.engine.calls();
    let delete_at = calls
        .iter()
        .position(|c| c.starts_with("delete_cluster"))
        .expect("delete_cluster call");
    assert!(
        calls[delete_at..]
            .iter()
            .all(|c| !c.starts_with("start_replica")),
        "no replica start after delete: {calls:?}"
    );
}

// ============================================================================
// S5 — Coordinator leadership transfer mid-phase
// ============================================================================

#[tokio::test]
async fn new_coordinator_leader_resumes_phase_and_election_lands_once() {
    let mut h = Harness::new();
    h.create("s2").await;
    let subscriber = Handle::new("client", 9);
    h.submit(Command::Subscribe {
        stream: sid("s2"),
        subscriber: subscriber.clone(),
    })
    .await;

    h.engine
        .set_log_tail(&node("n2"), LogTail::At { offset: 9, epoch: 1 });
    h.engine
        .set_log_tail(&node("n3"), LogTail::At { offset: 7, epoch: 1 });

    // Freeze the election at start_new_leader, as if the coordinator
    // leader died with the phase in flight.
    h.pause_on = Some("start_new_leader");
    h.kill_leader("s2").await;
    assert_eq!(h.paused_phases.len(), 1);
    assert_eq!(
        h.machine.stream(&sid("s2")).unwrap().status,
        StreamStatus::LeaderElection
    );

    // The new coordinator leader re-emits the in-flight phase.
    h.pause_on = None;
    let resumed: Vec<Phase> = h
        .machine
        .state_enter(RaftRole::Leader)
        .into_iter()
        .filter_map(|e| match e {
            Effect::Aux(AuxRequest::RunPhase { phase }) => Some(phase),
            _ => None,
        })
        .collect();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].name(), "start_new_leader");
    h.run_phase(resumed[0].clone()).await;

    let st = h.machine.stream(&sid("s2")).unwrap();
    assert_eq!(st.status, StreamStatus::Running);
    let new_leader = st.conf.leader_handle.clone().unwrap();

    // The orphaned original phase also completes; the writer is already
    // started and the duplicate leader_elected is a no-op.
    let orphan = h.paused_phases.remove(0);
    h.run_phase(orphan).await;
    let st = h.machine.stream(&sid("s2")).unwrap();
    assert_eq!(st.status, StreamStatus::Running);
    assert_eq!(st.conf.leader_handle, Some(new_leader.clone()));

    // Exactly one leader_up for the new leader reached the subscriber.
    let ups: Vec<_> = h
        .events_for(&subscriber)
        .into_iter()
        .filter(|e| matches!(e, StreamEvent::LeaderUp { leader, .. } if *leader == new_leader))
        .collect();
    assert_eq!(ups.len(), 1);
}

// ============================================================================
// S6 — Quorum loss and recovery
// ============================================================================

#[tokio::test]
async fn election_waits_for_quorum_then_elects_best_tail() {
    let mut h = Harness::new();
    h.create("s1").await;

    // Both replica nodes unreachable: stop_replicas tolerates this, the
    // quorum check cannot.
    h.engine.set_node_down(&node("n2"));
    h.engine.set_node_down(&node("n3"));
    h.engine
        .set_log_tail(&node("n1"), LogTail::At { offset: 5, epoch: 1 });
    h.kill_leader("s1").await;

    assert_eq!(
        h.machine.stream(&sid("s1")).unwrap().status,
        StreamStatus::LeaderElection
    );
    assert_eq!(h.failed_phases.len(), 1);

    // A retry without recovery fails again.
    h.respawn_failed().await;
    assert_eq!(h.failed_phases.len(), 1);

    // One node recovers with a longer log: quorum reached, n2 wins.
    h.engine.set_node_up(&node("n2"));
    h.engine
        .set_log_tail(&node("n2"), LogTail::At { offset: 9, epoch: 1 });
    h.respawn_failed().await;

    let st = h.machine.stream(&sid("s1")).unwrap();
    assert_eq!(st.status, StreamStatus::Running);
    assert_eq!(st.conf.leader_node, node("n2"));
    assert_eq!(st.conf.epoch, 2);
}

// ============================================================================
// Crashed replicas are restarted after an election
// ============================================================================

#[tokio::test]
async fn queued_replica_downs_replay_into_restarts_after_election() {
    let mut h = Harness::new();
    h.create("s1").await;
    let follower = h.machine.stream(&sid("s1")).unwrap().conf.replica_handles[1].clone();

    h.engine
        .set_log_tail(&node("n2"), LogTail::At { offset: 9, epoch: 1 });
    h.engine
        .set_log_tail(&node("n3"), LogTail::At { offset: 7, epoch: 1 });

    // Leader dies; while the election runs, a follower down arrives and is
    // queued behind it.
    h.pause_on = Some("check_quorum");
    h.kill_leader("s1").await;
    h.inject(Command::Down {
        handle: follower.clone(),
        reason: DownReason::NodeDown,
    })
    .await;
    h.pause_on = None;
    let paused = h.paused_phases.remove(0);
    h.run_phase(paused).await;

    // The election completed and the replayed down restarted the replica
    // on the follower's node.
    let st = h.machine.stream(&sid("s1")).unwrap();
    assert_eq!(st.status, StreamStatus::Running);
    assert!(
        st.conf
            .replica_handles
            .iter()
            .any(|hd| hd.node == follower.node && *hd != follower),
        "a fresh replica handle on {} expected: {:?}",
        follower.node,
        st.conf.replica_handles
    );
}
