//! Core identifier types shared across the coordinator.
//!
//! Stream and node names use `Arc<str>` to enable O(1) cloning instead of
//! O(n) string allocation. This matters because both are cloned on every
//! state-machine command, every monitor lookup, and every phase spawn.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Name of a managed stream.
pub type StreamId = Arc<str>;

/// Name of a fleet node.
pub type NodeId = Arc<str>;

/// Leadership generation counter for a single stream.
pub type Epoch = u64;

/// Opaque token identifying the originator of an in-flight command.
/// Assigned by the consensus layer; meaningful only to it.
pub type ReplyTo = u64;

/// Opaque identity of an external OS-level process (writer, replica, or
/// subscriber). Globally unique: the hosting node plus a node-local id
/// assigned by whoever spawned the process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle {
    /// Node the process runs on.
    pub node: NodeId,
    /// Node-local process id.
    pub id: u64,
}

impl Handle {
    pub fn new(node: impl Into<NodeId>, id: u64) -> Self {
        Self {
            node: node.into(),
            id,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.id)
    }
}

/// Role an external process plays for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The stream's single writer.
    Leader,
    /// A replica of the stream's log.
    Follower,
}

/// The last durable position in one replica's copy of a stream log.
///
/// Ordering is the election order: `Empty` sorts below every real tail, and
/// real tails compare by offset first, then by the epoch the offset was
/// written under. The derived `Ord` encodes exactly that.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum LogTail {
    /// No log exists (fresh replica, or wiped data directory).
    #[default]
    Empty,
    /// Last committed position.
    At { offset: u64, epoch: Epoch },
}

impl fmt::Display for LogTail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogTail::Empty => write!(f, "empty"),
            LogTail::At { offset, epoch } => write!(f, "{offset}@e{epoch}"),
        }
    }
}
