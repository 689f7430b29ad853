//! Error types for the stream coordinator.
//!
//! # Error Handling Patterns
//!
//! Two patterns, chosen by where the error surfaces:
//!
//! ## Client errors (propagate)
//!
//! Validation failures on the replicated command path — unknown stream,
//! duplicate create — are replied to the originator and never retried by the
//! coordinator.
//!
//! ## Phase errors (absorb and retry)
//!
//! Failures inside a side-effect phase — replica spawn errors, unreachable
//! nodes, a quorum that is not yet available — never fail a stream's
//! lifecycle. They are converted into scheduled retries and the coordinator
//! keeps trying until the operator deletes the stream.
//!
//! ## Guidelines
//!
//! - **apply path**: infallible; invalid commands produce error *replies*
//! - **phase path**: best-effort with logging, supervisor retries on crash
//! - **submission path**: timeouts round-robin to the next replica and only
//!   surface [`CoordinatorError::CoordinatorUnavailable`] once every replica
//!   has refused

use thiserror::Error;

use crate::types::{NodeId, StreamId};

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Errors surfaced by the coordinator and its collaborators.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The named stream is not managed by this coordinator.
    #[error("stream {0} not found")]
    NotFound(StreamId),

    /// A stream with this name already exists.
    #[error("stream {0} already started")]
    AlreadyStarted(StreamId),

    /// No coordinator replica accepted the command.
    #[error("coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    /// Command submission to a single replica timed out.
    #[error("command submission timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The targeted coordinator replica no longer exists.
    #[error("no such coordinator replica: {0}")]
    NoSuchReplica(NodeId),

    /// A replica process could not be started on a node.
    #[error("failed to start replica for {stream} on {node}: {reason}")]
    ReplicaStartFailed {
        stream: StreamId,
        node: NodeId,
        reason: String,
    },

    /// Fewer than a majority of member nodes reported a log overview.
    #[error("quorum not met for {stream}: {alive} of {members} members reachable")]
    QuorumNotMet {
        stream: StreamId,
        alive: usize,
        members: usize,
    },

    /// The target node is down. Tolerated during replica stop.
    #[error("node down: {0}")]
    NodeDown(NodeId),

    /// Error from the per-node log engine.
    #[error("log engine error: {0}")]
    Engine(String),

    /// Error from the durable topology registry.
    #[error("registry error: {0}")]
    Registry(String),

    /// Error from the consensus layer.
    #[error("consensus error: {0}")]
    Consensus(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordinatorError {
    /// Whether a failed command submission should fall through to the next
    /// coordinator replica instead of surfacing to the caller.
    #[inline]
    pub fn is_submission_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Timeout(_)
                | CoordinatorError::NoSuchReplica(_)
                | CoordinatorError::Consensus(_)
        )
    }

    /// Whether a failed phase should be respawned by the executor.
    ///
    /// Everything transient retries; only validation-class errors do not,
    /// and those never occur on the phase path.
    #[inline]
    pub fn is_phase_retryable(&self) -> bool {
        match self {
            CoordinatorError::QuorumNotMet { .. }
            | CoordinatorError::NodeDown(_)
            | CoordinatorError::Engine(_)
            | CoordinatorError::Registry(_)
            | CoordinatorError::Consensus(_)
            | CoordinatorError::Timeout(_)
            | CoordinatorError::ReplicaStartFailed { .. }
            | CoordinatorError::Io(_) => true,

            CoordinatorError::NotFound(_)
            | CoordinatorError::AlreadyStarted(_)
            | CoordinatorError::CoordinatorUnavailable(_)
            | CoordinatorError::NoSuchReplica(_)
            | CoordinatorError::Config(_)
            | CoordinatorError::Serde(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn sid(s: &str) -> StreamId {
        Arc::from(s)
    }

    #[test]
    fn test_not_found_display() {
        let err = CoordinatorError::NotFound(sid("orders"));
        assert!(err.to_string().contains("orders"));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_quorum_not_met_display() {
        let err = CoordinatorError::QuorumNotMet {
            stream: sid("orders"),
            alive: 1,
            members: 3,
        };
        let display = err.to_string();
        assert!(display.contains("orders"));
        assert!(display.contains("1 of 3"));
    }

    #[test]
    fn test_submission_retryable_classification() {
        assert!(CoordinatorError::Timeout(Duration::from_secs(5)).is_submission_retryable());
        assert!(CoordinatorError::NoSuchReplica(sid("n1")).is_submission_retryable());
        assert!(!CoordinatorError::NotFound(sid("s")).is_submission_retryable());
        assert!(!CoordinatorError::AlreadyStarted(sid("s")).is_submission_retryable());
    }

    #[test]
    fn test_phase_retryable_classification() {
        assert!(
            CoordinatorError::QuorumNotMet {
                stream: sid("s"),
                alive: 0,
                members: 3
            }
            .is_phase_retryable()
        );
        assert!(CoordinatorError::NodeDown(sid("n2")).is_phase_retryable());
        assert!(CoordinatorError::Engine("enoent".into()).is_phase_retryable());
        assert!(!CoordinatorError::Config("bad".into()).is_phase_retryable());
    }

    #[test]
    fn test_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(CoordinatorError::NodeDown(sid("n1")));
        assert!(err.to_string().contains("node down"));
    }
}
