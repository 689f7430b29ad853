//! Monitor bookkeeping for external processes and subscribers.
//!
//! The registry answers one question on every `Down` event: who died, and
//! in what capacity? Writers and replicas resolve to `(stream, role)`;
//! subscribers resolve to the set of streams they watch. The two kinds live
//! in disjoint maps so no runtime tag is needed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{Handle, Role, StreamId};

/// What a dead handle turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEntry {
    /// A stream process: writer or replica.
    Process { stream: StreamId, role: Role },
    /// A subscriber, with every stream it watched.
    Subscriber { streams: BTreeSet<StreamId> },
}

/// Replicated monitor state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MonitorRegistry {
    /// Stream processes: `handle → (stream, role)`.
    processes: BTreeMap<Handle, (StreamId, Role)>,
    /// Subscribers: `handle → streams watched`.
    subscribers: BTreeMap<Handle, BTreeSet<StreamId>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a writer or replica process.
    pub fn insert_process(&mut self, handle: Handle, stream: StreamId, role: Role) {
        self.processes.insert(handle, (stream, role));
    }

    /// Forget a stream process. Returns true if it was known.
    pub fn remove_process(&mut self, handle: &Handle) -> bool {
        self.processes.remove(handle).is_some()
    }

    /// Look up a stream process.
    pub fn process(&self, handle: &Handle) -> Option<&(StreamId, Role)> {
        self.processes.get(handle)
    }

    /// Whether `handle` is a currently-monitored stream process.
    pub fn is_live_process(&self, handle: &Handle) -> bool {
        self.processes.contains_key(handle)
    }

    /// Add `stream` to a subscriber's watch set, creating the entry if new.
    /// Returns true if the subscriber was not previously known at all.
    pub fn subscribe(&mut self, subscriber: Handle, stream: StreamId) -> bool {
        match self.subscribers.get_mut(&subscriber) {
            Some(streams) => {
                streams.insert(stream);
                false
            }
            None => {
                self.subscribers
                    .insert(subscriber, BTreeSet::from([stream]));
                true
            }
        }
    }

    /// Drop `stream` from a subscriber's watch set; the entry disappears
    /// when the set empties. Returns true if the subscriber has no
    /// remaining subscriptions.
    pub fn unsubscribe(&mut self, subscriber: &Handle, stream: &StreamId) -> bool {
        if let Some(streams) = self.subscribers.get_mut(subscriber) {
            streams.remove(stream);
            if streams.is_empty() {
                self.subscribers.remove(subscriber);
                return true;
            }
        }
        false
    }

    /// Streams a subscriber currently watches.
    pub fn subscriptions(&self, subscriber: &Handle) -> Option<&BTreeSet<StreamId>> {
        self.subscribers.get(subscriber)
    }

    /// Resolve a dead handle, removing it from the registry.
    pub fn take(&mut self, handle: &Handle) -> Option<MonitorEntry> {
        if let Some((stream, role)) = self.processes.remove(handle) {
            return Some(MonitorEntry::Process { stream, role });
        }
        self.subscribers
            .remove(handle)
            .map(|streams| MonitorEntry::Subscriber { streams })
    }

    /// All monitored process handles, for re-emission on leader transition.
    pub fn process_handles(&self) -> impl Iterator<Item = &Handle> {
        self.processes.keys()
    }

    /// All subscriber handles, for re-emission on leader transition.
    pub fn subscriber_handles(&self) -> impl Iterator<Item = &Handle> {
        self.subscribers.keys()
    }
}
