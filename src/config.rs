//! Coordinator configuration.
//!
//! Every tunable has a compiled-in default from [`crate::constants`] and an
//! environment override. Configuration is validated as a whole —
//! `validate()` collects every problem instead of stopping at the first —
//! so an operator sees the complete list in one pass.
//!
//! # Environment Variables
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `RIVULET_TICK_INTERVAL_SECS` | 60 | Membership reconcile interval |
//! | `RIVULET_RESTART_TIMEOUT_MS` | 1000 | Replica restart back-off base |
//! | `RIVULET_ELECTION_TIMEOUT_MS` | 5000 | Phase respawn delay |
//! | `RIVULET_STARTUP_LOCK_NAME` | `rivulet/startup` | First-join lock key |
//! | `RIVULET_MAX_PENDING_CMDS` | 512 | Per-stream pending command cap |

use std::time::Duration;

use crate::constants::{
    DEFAULT_ELECTION_TIMEOUT_MS, DEFAULT_MAX_PENDING_CMDS, DEFAULT_RESTART_TIMEOUT_MS,
    DEFAULT_STARTUP_LOCK_LEASE_MS, DEFAULT_STARTUP_LOCK_NAME, DEFAULT_TICK_INTERVAL_SECS,
};
use crate::error::{CoordinatorError, Result};

/// Runtime configuration for a coordinator replica.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often the leader reconciles Raft membership with the fleet.
    pub tick_interval: Duration,

    /// Base delay before retrying a failed replica start. The scheduled
    /// delay grows linearly with the attempt count.
    pub restart_timeout: Duration,

    /// Delay between respawns of a crashed phase task.
    pub election_timeout: Duration,

    /// Well-known coordination key serializing first-time cluster join.
    pub startup_lock_name: String,

    /// Lease duration for the startup lock.
    pub startup_lock_lease: Duration,

    /// Upper bound on commands buffered per stream while a phase is in
    /// flight. Commands beyond the cap are dropped with a warning.
    pub max_pending_cmds: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            restart_timeout: Duration::from_millis(DEFAULT_RESTART_TIMEOUT_MS),
            election_timeout: Duration::from_millis(DEFAULT_ELECTION_TIMEOUT_MS),
            startup_lock_name: DEFAULT_STARTUP_LOCK_NAME.to_string(),
            startup_lock_lease: Duration::from_millis(DEFAULT_STARTUP_LOCK_LEASE_MS),
            max_pending_cmds: DEFAULT_MAX_PENDING_CMDS,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset. Fails on unparseable values.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = env_u64("RIVULET_TICK_INTERVAL_SECS")? {
            config.tick_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("RIVULET_RESTART_TIMEOUT_MS")? {
            config.restart_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("RIVULET_ELECTION_TIMEOUT_MS")? {
            config.election_timeout = Duration::from_millis(ms);
        }
        if let Ok(name) = std::env::var("RIVULET_STARTUP_LOCK_NAME") {
            config.startup_lock_name = name;
        }
        if let Some(n) = env_u64("RIVULET_MAX_PENDING_CMDS")? {
            config.max_pending_cmds = n as usize;
        }

        if let Err(errors) = config.validate() {
            return Err(CoordinatorError::Config(errors.join(", ")));
        }
        Ok(config)
    }

    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.tick_interval.is_zero() {
            errors.push("tick_interval must be non-zero".to_string());
        }
        if self.restart_timeout.is_zero() {
            errors.push("restart_timeout must be non-zero".to_string());
        }
        if self.election_timeout.is_zero() {
            errors.push("election_timeout must be non-zero".to_string());
        }
        if self.startup_lock_name.is_empty() {
            errors.push("startup_lock_name must not be empty".to_string());
        }
        if self.max_pending_cmds == 0 {
            errors.push("max_pending_cmds must be at least 1".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Linear back-off delay for the given replica start attempt.
    pub fn restart_delay(&self, retries: u32) -> Duration {
        self.restart_timeout * retries.max(1)
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|e| CoordinatorError::Config(format!("{name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
