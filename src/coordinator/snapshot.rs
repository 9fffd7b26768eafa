use futures::Stream;
use serde_json::Value;

use crate::{
    events::{SnapshotChange, SnapshotChannel},
    store::Values,
};

/// An immutable, versioned copy of the cached key/value pairs.
///
/// Each refresh that changes anything produces a new snapshot with a higher
/// version; a snapshot obtained earlier keeps its old contents. The embedded
/// [`SnapshotChannel`] is shared by every version, so a holder can
/// [`watch`](Snapshot::watch) for newer versions without the coordinator.
#[derive(Debug, Clone)]
pub struct Snapshot {
    values: Values,
    version: u64,
    channel: SnapshotChannel,
}

impl Snapshot {
    pub(crate) fn empty(channel: SnapshotChannel) -> Self {
        Self {
            values: Values::new(),
            version: 0,
            channel,
        }
    }

    pub(crate) fn next(&self, values: Values) -> Self {
        Self {
            values,
            version: self.version + 1,
            channel: self.channel.clone(),
        }
    }

    /// Value stored under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Returns true if `name` is present.
    pub fn contains_key(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// All cached key/value pairs.
    pub fn values(&self) -> &Values {
        &self.values
    }

    /// Iterates over the cached keys.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Monotonic version; 0 until the first refresh that found any data.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The notification channel shared by all versions of this snapshot.
    pub fn channel(&self) -> &SnapshotChannel {
        &self.channel
    }

    /// Stream of changes applied after this call.
    pub fn watch(&self) -> impl Stream<Item = SnapshotChange> + Send + 'static {
        self.channel.watch()
    }

    /// The cached pairs as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(self.values.clone())
    }
}
