//! Phase implementations: the side-effecting half of every stream
//! lifecycle transition.
//!
//! Each phase is a crash-only routine executed by the aux executor on the
//! current consensus leader. On completion — success or a failure it can
//! name — it produces exactly one reply command for the state machine.
//! Anything it cannot handle surfaces as an `Err`, the task terminates
//! abnormally, and the executor respawns it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{CoordinatorError, Result};
use crate::types::{Handle, LogTail, NodeId};

use super::commands::{ClientReply, Command};
use super::stream::{Phase, RegistryRepair, StreamConfig};
use super::traits::{
    ClusterStart, ConsensusClient, LogEngine, NodeMembership, ReplicaStart, StopOutcome,
    StreamRegistry, UpdateOutcome, WriterStart,
};

/// Shared collaborators handed to every phase task.
pub struct PhaseContext {
    pub engine: Arc<dyn LogEngine>,
    pub registry: Arc<dyn StreamRegistry>,
    pub membership: Arc<dyn NodeMembership>,
    pub consensus: Arc<dyn ConsensusClient>,
}

/// Execute one phase to completion, returning the reply command to submit.
pub async fn run(phase: Phase, ctx: Arc<PhaseContext>) -> Result<Command> {
    match phase {
        Phase::StartCluster { conf } => start_cluster(conf, &ctx).await,
        Phase::DeleteCluster { conf } => delete_cluster(conf, &ctx).await,
        Phase::StartReplica {
            node,
            conf,
            retries,
        } => start_replica(node, conf, retries, &ctx).await,
        Phase::DeleteReplica { node, conf } => delete_replica(node, conf, &ctx).await,
        Phase::StopReplicas { conf } => stop_replicas(conf, &ctx).await,
        Phase::CheckQuorum { conf } => check_quorum(conf, &ctx).await,
        Phase::StartNewLeader { conf } => start_new_leader(conf, &ctx).await,
        Phase::RepairRegistry { repair, conf } => repair_registry(repair, conf, &ctx).await,
    }
}

async fn start_cluster(conf: StreamConfig, ctx: &PhaseContext) -> Result<Command> {
    let stream = conf.name.clone();
    match ctx.engine.start_cluster(&conf).await {
        Ok(outcome) => Ok(Command::StartClusterReply {
            stream,
            result: Ok(outcome.into_conf()),
        }),
        // A failure the engine could name still completes the phase; the
        // machine logs it and reschedules creation.
        Err(e) => Ok(Command::StartClusterReply {
            stream,
            result: Err(e.to_string()),
        }),
    }
}

async fn delete_cluster(conf: StreamConfig, ctx: &PhaseContext) -> Result<Command> {
    let size = ctx.engine.delete_cluster(&conf).await?;
    ctx.registry.delete(&conf.name, "coordinator").await?;
    Ok(Command::DeleteClusterReply {
        stream: conf.name,
        size,
    })
}

async fn start_replica(
    node: NodeId,
    conf: StreamConfig,
    retries: u32,
    ctx: &PhaseContext,
) -> Result<Command> {
    let stream = conf.name.clone();
    match ctx.engine.start_replica(&node, &conf).await {
        Ok(ReplicaStart::Started(handle)) => {
            Ok(Command::StartReplicaReply {
                handle: handle.clone(),
                conf: conf_with_replica(conf, node, handle),
            })
        }
        Ok(ReplicaStart::AlreadyPresent) => {
            debug!(stream = %stream, node = %node, "Replica already present");
            Ok(Command::PhaseFinished {
                stream,
                reply: ClientReply::Ok,
            })
        }
        Ok(ReplicaStart::AlreadyStarted(handle)) => {
            debug!(stream = %stream, node = %node, replica = %handle, "Replica already started");
            Ok(Command::PhaseFinished {
                stream,
                reply: ClientReply::Ok,
            })
        }
        Err(e) => Ok(Command::StartReplicaFailed {
            stream,
            node,
            retries,
            reason: e.to_string(),
        }),
    }
}

/// Fold a freshly started replica into the topology: the node joins the
/// replica set and its handle replaces any stale one.
fn conf_with_replica(mut conf: StreamConfig, node: NodeId, handle: Handle) -> StreamConfig {
    conf.remove_replica_handle_on(&node);
    if !conf.replica_nodes.contains(&node) {
        conf.replica_nodes.push(node);
    }
    conf.replica_handles.push(handle);
    conf
}

async fn delete_replica(node: NodeId, conf: StreamConfig, ctx: &PhaseContext) -> Result<Command> {
    // `conf` is already the post-removal topology; the engine call tears
    // down the process and its data.
    ctx.engine.delete_replica(&node, &conf).await?;
    Ok(Command::StreamUpdated { conf })
}

async fn stop_replicas(conf: StreamConfig, ctx: &PhaseContext) -> Result<Command> {
    for node in &conf.replica_nodes {
        match ctx.engine.stop_replica(node, &conf).await {
            Ok(StopOutcome::Stopped) => {}
            Ok(StopOutcome::NodeDown) => {
                debug!(stream = %conf.name, node = %node, "Node down while stopping replica");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Command::ReplicasStopped { stream: conf.name })
}

async fn check_quorum(conf: StreamConfig, ctx: &PhaseContext) -> Result<Command> {
    let members = conf.member_nodes();
    let mut tails: Vec<(NodeId, LogTail)> = Vec::new();
    for node in &members {
        match ctx.engine.log_overview(node, &conf.dir).await {
            Ok(Some(overview)) => tails.push((node.clone(), overview.tail())),
            Ok(None) => {
                debug!(stream = %conf.name, node = %node, "No stream log on node");
            }
            Err(e) => {
                debug!(stream = %conf.name, node = %node, error = %e, "Node unreachable during quorum check");
            }
        }
    }

    let needed = members.len() / 2 + 1;
    if tails.len() < needed {
        // Abnormal exit: the executor keeps retrying until enough nodes
        // report back.
        return Err(CoordinatorError::QuorumNotMet {
            stream: conf.name,
            alive: tails.len(),
            members: members.len(),
        });
    }

    Ok(Command::StartLeaderElection {
        stream: conf.name,
        new_epoch: conf.epoch + 1,
        tails,
    })
}

async fn start_new_leader(mut conf: StreamConfig, ctx: &PhaseContext) -> Result<Command> {
    // Clear any stale process before handing the node the writer role.
    match ctx.engine.stop_replica(&conf.leader_node, &conf).await {
        Ok(_) => {}
        Err(e) => {
            warn!(stream = %conf.name, node = %conf.leader_node, error = %e, "Could not stop stale process on new leader node");
        }
    }

    let handle = match ctx.engine.start_writer(&conf).await? {
        WriterStart::Started(handle) => handle,
        WriterStart::AlreadyStarted(handle) => handle,
    };
    conf.leader_handle = Some(handle);
    Ok(Command::LeaderElected { conf })
}

async fn repair_registry(
    repair: RegistryRepair,
    conf: StreamConfig,
    ctx: &PhaseContext,
) -> Result<Command> {
    let reply = match repair {
        RegistryRepair::New => {
            ctx.registry.declare(&conf).await?;
            ClientReply::StreamStarted { conf: conf.clone() }
        }
        RegistryRepair::Update => {
            match ctx.registry.update(&conf.name, &conf).await? {
                UpdateOutcome::Updated => {}
                UpdateOutcome::Missing => {
                    // Recovery race: the record vanished underneath us.
                    // Re-initialize it from the coordinator's topology.
                    warn!(stream = %conf.name, "Registry record missing on update, re-declaring");
                    ctx.registry.declare(&conf).await?;
                }
            }
            ClientReply::Ok
        }
    };
    Ok(Command::PhaseFinished {
        stream: conf.name,
        reply,
    })
}
