//! Replicated stream-cluster coordination.
//!
//! This module is the heart of the crate: a deterministic state machine
//! replicated by a Raft consensus layer, driving the lifecycle of
//! replicated stream clusters across a fleet of nodes.
//!
//! # Architecture
//!
//! ```text
//!        ┌────────────┐   submit    ┌──────────────────────────────┐
//!        │   client   │────────────▶│  consensus log (total order) │
//!        └────────────┘             └───────────────┬──────────────┘
//!                                                   │ apply on every replica
//!                                   ┌───────────────▼──────────────┐
//!                                   │  StreamCoordinator (machine) │
//!                                   │  streams · monitors · FSM    │
//!                                   └───────┬──────────────┬───────┘
//!                      monitor / send_msg / │              │ aux (leader only)
//!                      reply / delayed_cmd  │      ┌───────▼───────┐
//!                                           │      │ PhaseExecutor │
//!                                           │      └───────┬───────┘
//!                                           │              │ phases: log engine,
//!                                           │              │ registry, membership
//!                                           │      ┌───────▼───────┐
//!                                           └──────│ result cmds   │──▶ back into
//!                                                  └───────────────┘    the log
//! ```
//!
//! # Lifecycle of a stream
//!
//! A stream is created by `StartCluster`, lives in `Running`, and leaves
//! through `DeleteCluster`. Every transition out of `Running` carries
//! exactly one side-effecting phase; commands arriving meanwhile are
//! buffered and drained FIFO when the stream returns to `Running`. Leader
//! failure walks the election chain: stop replicas, check quorum, pick the
//! best log tail, start the new writer, repair the durable registry.

pub mod bootstrap;
pub mod client;
pub mod commands;
pub mod effects;
pub mod executor;
pub mod machine;
pub mod membership;
pub mod monitors;
pub mod phases;
pub mod stream;
pub mod testing;
pub mod traits;

pub use bootstrap::{BootstrapPlan, Bootstrapper};
pub use client::{CoordinatorClient, Replica};
pub use commands::{ClientReply, Command, DownReason, ErrorReply, PendingCmd};
pub use effects::{AuxRequest, CommandMeta, Effect, RaftRole, StreamEvent};
pub use executor::PhaseExecutor;
pub use machine::StreamCoordinator;
pub use membership::{ResizeSummary, reconcile};
pub use monitors::{MonitorEntry, MonitorRegistry};
pub use phases::PhaseContext;
pub use stream::{
    Phase, RegistryRepair, StreamConfig, StreamSpec, StreamState, StreamStatus, select_leader,
};
pub use traits::{
    ClusterStart, ConsensusClient, LogEngine, LogOverview, NodeMembership, NodeSelector,
    ReplicaStart, StartupLock, StopOutcome, StreamRegistry, UpdateOutcome, WriterStart,
};
