//! Crate-wide default tunables.
//!
//! Values here are the compiled-in defaults; every one of them can be
//! overridden through [`crate::config::CoordinatorConfig`].

/// How often the coordinator leader reconciles its own Raft membership with
/// the fleet's node list, in seconds.
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 60;

/// Base delay before a failed replica start is retried, in milliseconds.
/// The actual delay is linear in the attempt count: `base * retries`.
pub const DEFAULT_RESTART_TIMEOUT_MS: u64 = 1_000;

/// Delay between respawns of a crashed phase task, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MS: u64 = 5_000;

/// Well-known coordination key used to serialize first-time cluster join.
pub const DEFAULT_STARTUP_LOCK_NAME: &str = "rivulet/startup";

/// Lease duration for the startup lock, in milliseconds.
pub const DEFAULT_STARTUP_LOCK_LEASE_MS: u64 = 30_000;

/// Upper bound on commands buffered per stream while a phase is in flight.
pub const DEFAULT_MAX_PENDING_CMDS: usize = 512;
