//! # Rivulet
//! Replicated coordinator for clustered append-only stream logs.
//!
//! Rivulet manages the lifecycle of replicated streams (one writer, N
//! replicas) across a fleet of nodes. The authoritative topology for every
//! stream lives in a single deterministic state machine which is replicated
//! by a Raft consensus layer: commands are totally ordered, applied
//! identically on every coordinator replica, and all side effects (spawning
//! writers and replicas, repairing the durable topology registry, deleting
//! clusters) run as supervised *phases* on the current consensus leader.
//!
//! # Goals
//! - A pure, replayable `apply` — every byte of non-determinism lives in the
//!   leader-local phase executor
//! - Crash-only phases: a failed side effect is retried, never left half-done
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/) and
//!   [tracing](https://docs.rs/tracing)
//!
//! # Architecture
//!
//! ```text
//!   client ──submit──▶ any coordinator replica ──▶ Raft log
//!                                                    │ (total order)
//!                      ┌─────────────────────────────▼────┐
//!                      │  StreamCoordinator::apply (pure) │
//!                      └──────┬──────────────────┬────────┘
//!                             │ effects          │ aux effects (leader only)
//!                   monitor / reply /      ┌─────▼──────┐
//!                   send_msg / timer       │  executor  │──▶ log engine,
//!                                          └─────┬──────┘    registry, RPC
//!                                                │ result commands
//!                                                ▼
//!                                            Raft log
//! ```
//!
//! The consensus engine, the per-node log engine, and the durable topology
//! registry are consumed through the traits in [`coordinator::traits`]; this
//! crate owns only the coordination logic.

#![forbid(unsafe_code)]

pub mod config;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Main exports for embedding the coordinator.
    pub use crate::config::CoordinatorConfig;
    pub use crate::coordinator::{
        ClientReply, Command, CommandMeta, CoordinatorClient, Effect, PhaseExecutor,
        StreamCoordinator, StreamEvent,
    };
    pub use crate::error::{CoordinatorError, Result};
    pub use crate::types::{Epoch, Handle, LogTail, NodeId, StreamId};
}
