//! The leader-local phase executor.
//!
//! Interprets the `Aux` effects of the state machine on the current
//! consensus leader: spawning supervised phase tasks, resubmitting drained
//! pending commands, and running the membership reconcile tick. Nothing
//! here is replicated — the executor is recreated from replicated state on
//! every leadership transfer via `state_enter`.
//!
//! # Supervision
//!
//! Each phase runs in its own task. Normal termination submits the phase's
//! reply command and ends supervision. Abnormal termination (an `Err` or a
//! panic) respawns the same phase after a backoff, except a failed
//! `start_new_leader`, which respawns as `check_quorum`: offsets may have
//! moved while the writer was failing to start, so the election restarts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use backon::{BackoffBuilder, Retryable};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CoordinatorConfig;
use crate::metrics;
use crate::retry;
use crate::types::{ReplyTo, StreamId};

use super::commands::{Command, PendingCmd};
use super::effects::AuxRequest;
use super::membership;
use super::phases::{self, PhaseContext};
use super::stream::Phase;

/// Supervises phase tasks on the current consensus leader.
pub struct PhaseExecutor {
    ctx: Arc<PhaseContext>,
    config: CoordinatorConfig,
    /// One supervisor per stream; a new phase for a stream supersedes the
    /// old supervisor.
    tasks: Mutex<HashMap<StreamId, JoinHandle<()>>>,
    /// At most one membership reconcile in flight.
    resize: Mutex<Option<JoinHandle<()>>>,
}

impl PhaseExecutor {
    pub fn new(ctx: Arc<PhaseContext>, config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config,
            tasks: Mutex::new(HashMap::new()),
            resize: Mutex::new(None),
        })
    }

    /// Interpret one aux effect.
    pub fn handle(self: &Arc<Self>, request: AuxRequest) {
        match request {
            AuxRequest::RunPhase { phase } => self.spawn_phase(phase),
            AuxRequest::Pipeline { cmds } => self.spawn_pipeline(cmds),
            AuxRequest::ReconcileMembers => self.spawn_reconcile(),
        }
    }

    /// Drive the periodic membership reconcile while this replica leads
    /// the consensus group. Abort the returned handle on leadership loss.
    pub fn spawn_tick_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                this.spawn_reconcile();
            }
        })
    }

    /// Number of phase supervisors currently alive, for health reporting.
    pub fn active_phases(&self) -> usize {
        self.tasks
            .lock()
            .expect("task registry")
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Abort every supervisor. Called when this replica stops being the
    /// consensus leader; orphaned phase work is resumed by the new leader.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().expect("task registry");
        for (stream, task) in tasks.drain() {
            debug!(stream = %stream, "Aborting phase supervisor on shutdown");
            task.abort();
        }
        if let Some(task) = self.resize.lock().expect("resize slot").take() {
            task.abort();
        }
    }

    fn spawn_phase(self: &Arc<Self>, phase: Phase) {
        let stream = phase.stream().clone();
        metrics::PHASES_SPAWNED
            .with_label_values(&[phase.name()])
            .inc();

        let this = Arc::clone(self);
        let supervisor = tokio::spawn(async move {
            this.supervise(phase).await;
        });

        let mut tasks = self.tasks.lock().expect("task registry");
        tasks.retain(|_, task| !task.is_finished());
        if let Some(previous) = tasks.insert(stream.clone(), supervisor) {
            // The machine replaced the stream's phase; the old supervisor
            // is stale.
            debug!(stream = %stream, "Superseding previous phase supervisor");
            previous.abort();
        }
    }

    async fn supervise(self: &Arc<Self>, mut phase: Phase) {
        let mut backoff = retry::phase_policy().build();
        loop {
            let attempt = tokio::spawn(phases::run(phase.clone(), Arc::clone(&self.ctx)));
            let outcome = attempt.await;

            match outcome {
                Ok(Ok(cmd)) => {
                    self.submit_result(cmd).await;
                    return;
                }
                Ok(Err(e)) => {
                    warn!(
                        stream = %phase.stream(),
                        phase = phase.name(),
                        error = %e,
                        "Phase failed, respawning"
                    );
                }
                Err(join_err) => {
                    warn!(
                        stream = %phase.stream(),
                        phase = phase.name(),
                        error = %join_err,
                        "Phase task panicked, respawning"
                    );
                }
            }

            metrics::PHASE_RETRIES
                .with_label_values(&[phase.name()])
                .inc();

            // Offsets may have changed while the writer failed to start;
            // restart the election from the quorum check.
            phase = match phase {
                Phase::StartNewLeader { conf } => Phase::CheckQuorum { conf },
                other => other,
            };

            let delay = backoff.next().unwrap_or(self.config.election_timeout);
            tokio::time::sleep(delay).await;
        }
    }

    /// Submit a phase's reply command, retrying transient failures. Loss
    /// is survivable — the next leader transition resumes the phase — but
    /// cheap retries avoid stalling the stream until then.
    async fn submit_result(&self, cmd: Command) {
        let consensus = Arc::clone(&self.ctx.consensus);
        let name = cmd.name();
        let submit = || {
            let consensus = Arc::clone(&consensus);
            let cmd = cmd.clone();
            async move { consensus.resubmit(None, cmd).await }
        };
        if let Err(e) = submit.retry(retry::submission_policy()).await {
            warn!(command = name, error = %e, "Failed to submit phase result");
        }
    }

    fn spawn_pipeline(self: &Arc<Self>, cmds: Vec<PendingCmd>) {
        let consensus = Arc::clone(&self.ctx.consensus);
        tokio::spawn(async move {
            for PendingCmd { from, cmd } in cmds {
                resubmit_with_retry(&consensus, from, cmd).await;
            }
        });
    }

    fn spawn_reconcile(self: &Arc<Self>) {
        let mut slot = self.resize.lock().expect("resize slot");
        if let Some(task) = slot.as_ref()
            && !task.is_finished()
        {
            debug!("Membership reconcile already in flight, skipping tick");
            return;
        }

        let ctx = Arc::clone(&self.ctx);
        *slot = Some(tokio::spawn(async move {
            match membership::reconcile(ctx.consensus.as_ref(), ctx.membership.as_ref()).await {
                Ok(summary) if summary.changed() => {
                    debug!(
                        added = summary.added.len(),
                        removed = summary.removed.len(),
                        "Coordinator membership reconciled"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Membership reconcile failed");
                }
            }
        }));
    }
}

async fn resubmit_with_retry(
    consensus: &Arc<dyn super::traits::ConsensusClient>,
    from: Option<ReplyTo>,
    cmd: Command,
) {
    let name = cmd.name();
    let submit = || {
        let consensus = Arc::clone(consensus);
        let cmd = cmd.clone();
        async move { consensus.resubmit(from, cmd).await }
    };
    if let Err(e) = submit.retry(retry::submission_policy()).await {
        warn!(command = name, error = %e, "Failed to resubmit pending command");
    }
}
