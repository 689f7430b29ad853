//! Effect descriptors emitted by the state machine.
//!
//! `apply` never performs I/O. It returns a list of effects which the
//! consensus layer interprets in emission order: monitor bookkeeping,
//! best-effort messages, replies, timers, and instructions for the
//! leader-local aux executor. Keeping effects as plain data is what makes
//! the machine replayable — a replica applying the same command sequence
//! produces the identical effect list, byte for byte.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Handle, ReplyTo, StreamId};

use super::commands::{ClientReply, Command, PendingCmd};
use super::stream::Phase;

/// Metadata the consensus layer attaches to each applied command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CommandMeta {
    /// Position of the command in the replicated log.
    pub index: u64,
    /// Consensus term the command was committed under.
    pub term: u64,
    /// Originator token, present for client-submitted commands.
    pub from: Option<ReplyTo>,
}

/// Role of this coordinator replica in the consensus group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Leader,
    Follower,
}

/// Events delivered to stream subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// The stream has a live writer.
    LeaderUp {
        stream: StreamId,
        reference: String,
        leader: Handle,
    },
    /// The stream's writer died; an election is under way. `leader` is
    /// the dead writer, absent when the stream never had one (subscribing
    /// to a stream that is still starting, or mid-election).
    LeaderDown {
        stream: StreamId,
        reference: String,
        leader: Option<Handle>,
    },
    /// The stream was deleted.
    StreamDeleted { stream: StreamId, reference: String },
}

/// Instructions for the leader-local aux executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuxRequest {
    /// Spawn (or resume) a supervised phase task.
    RunPhase { phase: Phase },
    /// Resubmit drained pending commands into the consensus log.
    Pipeline { cmds: Vec<PendingCmd> },
    /// Reconcile coordinator Raft membership with the fleet node list.
    ReconcileMembers,
}

/// Effects emitted by `apply`, interpreted by the consensus layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Effect {
    /// Request a `Down` notification when `handle` dies.
    Monitor(Handle),
    /// Stop watching `handle`.
    Demonitor(Handle),
    /// Asynchronous, best-effort delivery to a subscriber.
    SendMsg { to: Handle, event: StreamEvent },
    /// Reply to the originator of a command.
    Reply { to: ReplyTo, reply: ClientReply },
    /// Instruct the leader-local aux executor.
    Aux(AuxRequest),
    /// Schedule a command via a consensus-layer timer.
    DelayedCmd { delay: Duration, cmd: Command },
}

impl Effect {
    /// Convenience constructor for phase-run effects.
    pub fn run_phase(phase: Phase) -> Self {
        Effect::Aux(AuxRequest::RunPhase { phase })
    }

    /// Convenience constructor for reply effects.
    pub fn reply(to: ReplyTo, reply: ClientReply) -> Self {
        Effect::Reply { to, reply }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_effect_serde_roundtrip() {
        let effect = Effect::SendMsg {
            to: Handle::new("client-1", 9),
            event: StreamEvent::LeaderUp {
                stream: Arc::from("orders"),
                reference: "queue/orders".to_string(),
                leader: Handle::new("n1", 100),
            },
        };
        let json = serde_json::to_string(&effect).unwrap();
        let back: Effect = serde_json::from_str(&json).unwrap();
        assert_eq!(effect, back);
    }

    #[test]
    fn test_delayed_cmd_preserves_duration() {
        let effect = Effect::DelayedCmd {
            delay: Duration::from_millis(2_000),
            cmd: Command::StartReplica {
                stream: Arc::from("orders"),
                node: Arc::from("n4"),
                retries: 2,
            },
        };
        let json = serde_json::to_string(&effect).unwrap();
        let back: Effect = serde_json::from_str(&json).unwrap();
        assert_eq!(effect, back);
    }
}
