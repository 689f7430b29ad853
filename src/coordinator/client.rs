//! Client surface of the coordinator.
//!
//! Commands may be submitted to any coordinator replica; the consensus
//! layer forwards them to its leader. A submission that times out or hits
//! a vanished replica rotates to the next one, starting from the last
//! replica that accepted a command. Only when every replica has refused
//! does the caller see `CoordinatorUnavailable`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::error::{CoordinatorError, Result};
use crate::types::{Handle, NodeId, StreamId};

use super::commands::{ClientReply, Command, ErrorReply};
use super::stream::StreamSpec;
use super::traits::ConsensusClient;

/// A coordinator replica a client can submit to.
pub struct Replica {
    pub node: NodeId,
    pub connection: Arc<dyn ConsensusClient>,
}

/// Round-robin command submission over the coordinator replicas.
pub struct CoordinatorClient {
    replicas: Vec<Replica>,
    /// Index of the last replica that accepted a command.
    preferred: AtomicUsize,
}

impl CoordinatorClient {
    pub fn new(replicas: Vec<Replica>) -> Self {
        Self {
            replicas,
            preferred: AtomicUsize::new(0),
        }
    }

    /// Create a stream cluster.
    pub async fn start_cluster(&self, spec: StreamSpec) -> Result<(ClientReply, NodeId)> {
        let stream = spec.name.clone();
        let (reply, node) = self.submit(Command::StartCluster { spec }).await?;
        Ok((into_result(reply, &stream)?, node))
    }

    /// Tear a stream cluster down.
    pub async fn delete_cluster(
        &self,
        stream: StreamId,
        user: &str,
    ) -> Result<(ClientReply, NodeId)> {
        let (reply, node) = self
            .submit(Command::DeleteCluster {
                stream: stream.clone(),
                user: user.to_string(),
            })
            .await?;
        Ok((into_result(reply, &stream)?, node))
    }

    /// Add a replica on `node`.
    pub async fn add_replica(
        &self,
        stream: StreamId,
        node: NodeId,
    ) -> Result<(ClientReply, NodeId)> {
        let (reply, accepted_by) = self
            .submit(Command::StartReplica {
                stream: stream.clone(),
                node,
                retries: 1,
            })
            .await?;
        Ok((into_result(reply, &stream)?, accepted_by))
    }

    /// Remove the replica on `node`.
    pub async fn delete_replica(
        &self,
        stream: StreamId,
        node: NodeId,
    ) -> Result<(ClientReply, NodeId)> {
        let (reply, accepted_by) = self
            .submit(Command::DeleteReplica {
                stream: stream.clone(),
                node,
            })
            .await?;
        Ok((into_result(reply, &stream)?, accepted_by))
    }

    /// Register for leader events of `stream`.
    pub async fn subscribe(
        &self,
        stream: StreamId,
        subscriber: Handle,
    ) -> Result<(ClientReply, NodeId)> {
        let (reply, node) = self
            .submit(Command::Subscribe {
                stream: stream.clone(),
                subscriber,
            })
            .await?;
        Ok((into_result(reply, &stream)?, node))
    }

    /// Drop a registration.
    pub async fn unsubscribe(
        &self,
        stream: StreamId,
        subscriber: Handle,
    ) -> Result<(ClientReply, NodeId)> {
        let (reply, node) = self
            .submit(Command::Unsubscribe {
                stream: stream.clone(),
                subscriber,
            })
            .await?;
        Ok((into_result(reply, &stream)?, node))
    }

    /// Submit to replicas in rotation until one accepts.
    async fn submit(&self, cmd: Command) -> Result<(ClientReply, NodeId)> {
        if self.replicas.is_empty() {
            return Err(CoordinatorError::CoordinatorUnavailable(
                "no replicas configured".to_string(),
            ));
        }

        let start = self.preferred.load(Ordering::Relaxed);
        let mut last_error = None;
        for i in 0..self.replicas.len() {
            let index = (start + i) % self.replicas.len();
            let replica = &self.replicas[index];
            match replica.connection.submit(cmd.clone()).await {
                Ok(reply) => {
                    self.preferred.store(index, Ordering::Relaxed);
                    return Ok((reply, replica.node.clone()));
                }
                Err(e) if e.is_submission_retryable() => {
                    debug!(replica = %replica.node, error = %e, "Replica refused command, rotating");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(CoordinatorError::CoordinatorUnavailable(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "all replicas refused".to_string()),
        ))
    }
}

/// Surface client-class error replies as errors.
fn into_result(reply: ClientReply, stream: &StreamId) -> Result<ClientReply> {
    match reply {
        ClientReply::Error(ErrorReply::NotFound) => {
            Err(CoordinatorError::NotFound(stream.clone()))
        }
        ClientReply::Error(ErrorReply::AlreadyStarted) => {
            Err(CoordinatorError::AlreadyStarted(stream.clone()))
        }
        ClientReply::Error(ErrorReply::ReplicaStartFailed { node, reason }) => {
            Err(CoordinatorError::ReplicaStartFailed {
                stream: stream.clone(),
                node,
                reason,
            })
        }
        reply => Ok(reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::testing::MockConsensus;
    use std::sync::Arc;

    fn node(s: &str) -> NodeId {
        Arc::from(s)
    }

    fn sid(s: &str) -> StreamId {
        Arc::from(s)
    }

    fn replica(name: &str, consensus: Arc<MockConsensus>) -> Replica {
        Replica {
            node: node(name),
            connection: consensus,
        }
    }

    #[tokio::test]
    async fn test_submission_rotates_past_failing_replica() {
        let bad = Arc::new(MockConsensus::default());
        bad.fail_next_submit("timeout");
        let good = Arc::new(MockConsensus::default());

        let client = CoordinatorClient::new(vec![
            replica("n1", bad),
            replica("n2", good.clone()),
        ]);

        let (_, accepted_by) = client
            .unsubscribe(sid("s1"), Handle::new("client", 1))
            .await
            .unwrap();
        assert_eq!(accepted_by, node("n2"));
        assert_eq!(good.take_submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_preferred_replica_is_reused() {
        let bad = Arc::new(MockConsensus::default());
        bad.fail_next_submit("timeout");
        bad.fail_next_submit("timeout");
        let good = Arc::new(MockConsensus::default());

        let client = CoordinatorClient::new(vec![
            replica("n1", bad.clone()),
            replica("n2", good.clone()),
        ]);

        client
            .unsubscribe(sid("s1"), Handle::new("client", 1))
            .await
            .unwrap();
        // Second submission goes straight to the replica that worked;
        // n1's second queued failure is never consumed.
        client
            .unsubscribe(sid("s1"), Handle::new("client", 2))
            .await
            .unwrap();
        assert_eq!(good.take_submitted().len(), 2);
        assert_eq!(bad.take_submitted().len(), 0);
    }

    #[tokio::test]
    async fn test_all_replicas_refusing_is_unavailable() {
        let a = Arc::new(MockConsensus::default());
        a.fail_next_submit("timeout");
        let b = Arc::new(MockConsensus::default());
        b.fail_next_submit("timeout");

        let client = CoordinatorClient::new(vec![replica("n1", a), replica("n2", b)]);
        let err = client
            .unsubscribe(sid("s1"), Handle::new("client", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::CoordinatorUnavailable(_)));
    }

    #[tokio::test]
    async fn test_no_replicas_is_unavailable() {
        let client = CoordinatorClient::new(vec![]);
        let err = client
            .unsubscribe(sid("s1"), Handle::new("client", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::CoordinatorUnavailable(_)));
    }
}
