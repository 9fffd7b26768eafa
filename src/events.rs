//! Change notifications emitted by the coordinator and by snapshots.
//!
//! Every refresh cycle emits, in order: the mutation event (`Set` or
//! `Delete`) if the cycle was caused by a local write, `Changed` if the store
//! contents differ from the cached snapshot, and always `Refresh`.

use std::sync::Arc;

use futures::{Stream, StreamExt, future};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::{
    coordinator::Snapshot,
    diff::{Patch, pointer},
};

/// Events published on a coordinator's notification channel.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// A key was written through the coordinator.
    Set {
        /// The written key
        name: String,
        /// The value handed to the store
        value: Value,
    },
    /// A key was removed through the coordinator.
    Delete {
        /// The removed key
        name: String,
    },
    /// A refresh found differences between the cache and the store.
    Changed {
        /// The snapshot after the patch was applied
        snapshot: Arc<Snapshot>,
        /// The operations that were applied
        patch: Patch,
    },
    /// A refresh completed, whether or not anything changed.
    Refresh {
        /// The current snapshot
        snapshot: Arc<Snapshot>,
    },
}

impl CacheEvent {
    /// Short lowercase name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            CacheEvent::Set { .. } => "set",
            CacheEvent::Delete { .. } => "delete",
            CacheEvent::Changed { .. } => "changed",
            CacheEvent::Refresh { .. } => "refresh",
        }
    }

    /// Returns true when the event concerns a key matching `pattern`.
    ///
    /// `Set` and `Delete` match on their key; `Changed` matches when any patch
    /// operation's path, written with dots, matches. `Refresh` is not tied to
    /// any key and never matches.
    pub fn matches(&self, pattern: &str) -> bool {
        match self {
            CacheEvent::Set { name, .. } | CacheEvent::Delete { name } => {
                path_matches(name, pattern)
            }
            CacheEvent::Changed { patch, .. } => patch.iter().any(|operation| {
                pointer::split(operation.path())
                    .is_ok_and(|segments| path_matches(&segments.join("."), pattern))
            }),
            CacheEvent::Refresh { .. } => false,
        }
    }
}

/// A change notification carried on a snapshot's own channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotChange {
    /// Version of the snapshot the patch produced
    pub version: u64,
    /// The operations that were applied
    pub patch: Patch,
}

/// The notification channel embedded in every snapshot.
///
/// All versions of a coordinator's snapshot share one channel, so a consumer
/// handed any snapshot can watch for later changes without holding the
/// coordinator.
#[derive(Debug, Clone)]
pub struct SnapshotChannel {
    sender: broadcast::Sender<SnapshotChange>,
}

impl SnapshotChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub(crate) fn emit(&self, change: SnapshotChange) {
        let _ = self.sender.send(change);
    }

    /// Subscribes to changes applied after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotChange> {
        self.sender.subscribe()
    }

    /// Stream of changes applied after this call.
    pub fn watch(&self) -> impl Stream<Item = SnapshotChange> + Send + 'static {
        receiver_stream(self.sender.subscribe())
    }
}

/// Sender side of a coordinator's notification channel.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub(crate) fn emit(&self, event: CacheEvent) {
        debug!(event = event.name(), "Emitting cache event");
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }
}

/// Adapts a broadcast receiver into a stream, skipping over lag gaps.
pub(crate) fn receiver_stream<T>(
    receiver: broadcast::Receiver<T>,
) -> impl Stream<Item = T> + Send + 'static
where
    T: Clone + Send + 'static,
{
    BroadcastStream::new(receiver).filter_map(|item| {
        future::ready(match item {
            Ok(item) => Some(item),
            Err(lagged) => {
                debug!("Event stream lagged: {lagged}");
                None
            }
        })
    })
}

/// Checks if a dot-separated key path matches a given pattern
///
/// # Arguments
/// * `path` - The actual key path
/// * `pattern` - The pattern to match against (supports "*" as wildcard)
///
/// # Examples
/// * `"server.port"` matches `"server.port"`
/// * `"server.port"` matches `"server.*"`
/// * `"server.port"` matches `"*"`
pub fn path_matches(path: &str, pattern: &str) -> bool {
    const WILDCARD: &str = "*";

    if pattern == WILDCARD {
        return true;
    };

    let path_parts: Vec<&str> = path.split('.').collect();
    let pattern_parts: Vec<&str> = pattern.split('.').collect();

    if pattern_parts.len() > path_parts.len() && pattern_parts.last() != Some(&WILDCARD) {
        return false;
    }

    for (path_part, pattern_part) in path_parts.iter().zip(pattern_parts.iter()) {
        if pattern_part == &WILDCARD {
            continue;
        }

        if path_part != pattern_part {
            return false;
        }
    }

    true
}
