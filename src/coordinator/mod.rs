//! The refresh coordinator: owns the live snapshot, decides when to go back to
//! the store, coalesces concurrent refreshes and fans out notifications.

mod snapshot;

#[cfg(test)]
mod tests;

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::{
    FutureExt, Stream, StreamExt,
    future::{self, BoxFuture, Shared},
};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

pub use snapshot::Snapshot;

use crate::{
    CacheError, Result,
    diff::{self, Patch},
    error::KeyFailure,
    events::{CacheEvent, EventBus, SnapshotChange, SnapshotChannel, receiver_stream},
    extension::{Extension, ExtensionRegistry, PublishOp},
    store::{Store, Values},
};

/// Default buffer size of the coordinator and snapshot channels.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

type PendingRefresh = Shared<BoxFuture<'static, Result<Arc<Snapshot>>>>;

/// A refreshing cache over a [`Store`].
///
/// Cloning is cheap; all clones share the same snapshot, extensions and
/// notification channel. When the last clone is dropped every proactive
/// policy registered through it is unsubscribed.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    core: Arc<Core>,
    extensions: ExtensionRegistry,
}

/// State touched by an in-flight refresh. Kept apart from `Inner` so the
/// pending future never keeps the registry alive.
struct Core {
    store: Arc<dyn Store>,
    snapshot: RwLock<Arc<Snapshot>>,
    populated: AtomicBool,
    in_flight: Mutex<Option<PendingRefresh>>,
    events: EventBus,
}

/// A weak reference to a coordinator, handed to proactive policies.
///
/// Holding a handle does not keep the coordinator alive.
#[derive(Clone)]
pub struct RefreshHandle {
    inner: Weak<Inner>,
}

/// Builder for [`RefreshCoordinator`].
pub struct CoordinatorBuilder {
    store: Option<Arc<dyn Store>>,
    event_capacity: usize,
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self {
            store: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl CoordinatorBuilder {
    /// Sets the backing store.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the buffer size of the notification channels.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Builds the coordinator.
    ///
    /// # Errors
    /// * `CacheError::MissingDependency` - If no store was supplied
    /// * `CacheError::InvalidArgument` - If the event capacity is zero
    pub fn build(self) -> Result<RefreshCoordinator> {
        let store = self.store.ok_or_else(|| CacheError::MissingDependency {
            dependency: "store".to_string(),
        })?;

        if self.event_capacity == 0 {
            return Err(CacheError::invalid_argument(
                "event_capacity",
                "must be greater than zero",
            ));
        }

        Ok(RefreshCoordinator::assemble(store, self.event_capacity))
    }
}

impl RefreshCoordinator {
    /// Creates a coordinator over `store` with default settings.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::assemble(store, DEFAULT_EVENT_CAPACITY)
    }

    /// Starts building a coordinator.
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    fn assemble(store: Arc<dyn Store>, event_capacity: usize) -> Self {
        let channel = SnapshotChannel::new(event_capacity);

        let core = Core {
            store,
            snapshot: RwLock::new(Arc::new(Snapshot::empty(channel))),
            populated: AtomicBool::new(false),
            in_flight: Mutex::new(None),
            events: EventBus::new(event_capacity),
        };

        Self {
            inner: Arc::new(Inner {
                core: Arc::new(core),
                extensions: ExtensionRegistry::default(),
            }),
        }
    }

    /// Reads a single key, refreshing first if a policy asks for it.
    ///
    /// Returns `Ok(None)` when the key is absent.
    ///
    /// # Errors
    /// * `CacheError::InvalidArgument` - If `name` is empty
    /// * `CacheError::Store` - If a required refresh fails
    #[instrument(skip(self))]
    pub async fn read(&self, name: &str) -> Result<Option<Value>> {
        ensure_name(name)?;

        let snapshot = self.refresh_if_needed().await?;
        Ok(snapshot.get(name).cloned())
    }

    /// Returns the whole snapshot, refreshing first if a policy asks for it.
    ///
    /// # Errors
    /// * `CacheError::Store` - If a required refresh fails
    #[instrument(skip(self))]
    pub async fn read_all(&self) -> Result<Arc<Snapshot>> {
        self.refresh_if_needed().await
    }

    /// Writes a key to the store, announces it and refreshes.
    ///
    /// On success emits `Set`, notifies every change publisher (whose failures
    /// are logged and ignored) and returns the refreshed snapshot.
    ///
    /// # Errors
    /// * `CacheError::InvalidArgument` - If `name` is empty
    /// * `CacheError::Store` - If the store rejects the write (nothing is
    ///   emitted) or the follow-up refresh fails
    #[instrument(skip(self, value))]
    pub async fn write(&self, name: &str, value: Value) -> Result<Arc<Snapshot>> {
        ensure_name(name)?;

        self.inner.core.store.write(name, &value).await?;
        debug!("Key written to store");

        self.inner.core.events.emit(CacheEvent::Set {
            name: name.to_string(),
            value: value.clone(),
        });
        self.publish(PublishOp::Set, name, Some(&value)).await;

        self.refresh().await
    }

    /// Removes a key from the store, announces it and refreshes.
    ///
    /// # Errors
    /// * `CacheError::InvalidArgument` - If `name` is empty
    /// * `CacheError::Store` - If the store rejects the removal (nothing is
    ///   emitted) or the follow-up refresh fails
    #[instrument(skip(self))]
    pub async fn remove(&self, name: &str) -> Result<Arc<Snapshot>> {
        ensure_name(name)?;

        self.inner.core.store.remove(name).await?;
        debug!("Key removed from store");

        self.inner.core.events.emit(CacheEvent::Delete {
            name: name.to_string(),
        });
        self.publish(PublishOp::Delete, name, None).await;

        self.refresh().await
    }

    /// Applies a JSON-patch style document through the store.
    ///
    /// The patch is merged onto a copy of the current values, so operations
    /// computed against another snapshot still apply: removes of absent paths
    /// are skipped and replaces of absent paths act as adds. Operations are then
    /// grouped by top-level key. A key that still has a value afterwards is
    /// written; a key that existed before and is gone afterwards is removed.
    /// All writes and removes run concurrently. Keys that succeeded are not
    /// rolled back when others fail.
    ///
    /// # Errors
    /// * `CacheError::InvalidPatch` - If an operation's path is malformed
    /// * `CacheError::Store` - If the initial refresh fails
    /// * `CacheError::PatchApply` - If any derived write or remove fails
    #[instrument(skip(self, patch), fields(operations = patch.len()))]
    pub async fn apply_patch(&self, patch: &Patch) -> Result<()> {
        let keys = patch.top_level_keys()?;
        if keys.is_empty() {
            return Ok(());
        }

        let before = self.refresh_if_needed().await?;
        let mut after = before.values().clone();
        diff::merge(&mut after, patch)?;

        let pending: Vec<BoxFuture<'static, (String, Result<Arc<Snapshot>>)>> = keys
            .into_iter()
            .filter_map(|key| match after.get(&key) {
                Some(value) => {
                    let coordinator = self.clone();
                    let value = value.clone();
                    Some(
                        async move {
                            let result = coordinator.write(&key, value).await;
                            (key, result)
                        }
                        .boxed(),
                    )
                }
                None if before.contains_key(&key) => {
                    let coordinator = self.clone();
                    Some(
                        async move {
                            let result = coordinator.remove(&key).await;
                            (key, result)
                        }
                        .boxed(),
                    )
                }
                None => None,
            })
            .collect();

        let failures: Vec<KeyFailure> = future::join_all(pending)
            .await
            .into_iter()
            .filter_map(|(key, result)| {
                result.err().map(|e| KeyFailure {
                    key,
                    details: e.to_string(),
                })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            warn!(failed = failures.len(), "Patch partially applied");
            Err(CacheError::PatchApply { failures })
        }
    }

    /// Refreshes from the store, joining a refresh already in flight.
    ///
    /// Every caller that joins the same fetch receives the same snapshot.
    ///
    /// # Errors
    /// * `CacheError::Store` - If the fetch fails; the previous snapshot is kept
    pub async fn refresh(&self) -> Result<Arc<Snapshot>> {
        self.inner.core.refresh().await
    }

    /// Refreshes if this is the first access or a reactive policy asks for
    /// it; otherwise returns the current snapshot without touching the store.
    ///
    /// # Errors
    /// * `CacheError::Store` - If a required refresh fails
    pub async fn refresh_if_needed(&self) -> Result<Arc<Snapshot>> {
        if !self.is_populated() {
            debug!("First access, refreshing unconditionally");
            return self.refresh().await;
        }

        if self.inner.extensions.should_refresh() {
            debug!("Refresh policy requested a refresh");
            return self.refresh().await;
        }

        Ok(self.current())
    }

    /// Attaches an extension. `None` is accepted and ignored.
    ///
    /// Returns `self` so registrations can be chained.
    ///
    /// # Errors
    /// Returns whatever the extension's own `subscribe` reports, typically
    /// `CacheError::AlreadySubscribed`. A refused extension is not registered.
    pub fn with_extension<E>(&self, extension: impl Into<Option<Arc<E>>>) -> Result<&Self>
    where
        E: Extension + ?Sized,
    {
        let Some(extension) = extension.into() else {
            return Ok(self);
        };

        self.inner.extensions.register(extension, self.handle())?;
        Ok(self)
    }

    /// Unsubscribes every proactive policy registered so far.
    pub fn detach_proactive(&self) {
        self.inner.extensions.detach_all();
    }

    /// A weak handle for triggering refreshes from background tasks.
    pub fn handle(&self) -> RefreshHandle {
        RefreshHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The current snapshot, without consulting any policy.
    pub fn current(&self) -> Arc<Snapshot> {
        self.inner.core.current()
    }

    /// Returns true once a refresh has succeeded.
    pub fn is_populated(&self) -> bool {
        self.inner.core.populated.load(Ordering::SeqCst)
    }

    /// Subscribes to every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.core.events.subscribe()
    }

    /// Stream of every event emitted after this call.
    pub fn events(&self) -> impl Stream<Item = CacheEvent> + Send + 'static {
        receiver_stream(self.subscribe())
    }

    /// Stream of key-scoped events whose key matches `pattern`.
    ///
    /// # Arguments
    /// * `pattern` - Dot-separated key pattern (supports "*" wildcards)
    pub fn watch_keys(&self, pattern: &str) -> impl Stream<Item = CacheEvent> + Send + 'static {
        let pattern = pattern.to_string();

        self.events()
            .filter(move |event| future::ready(event.matches(&pattern)))
    }

    #[cfg(test)]
    pub(crate) fn extension_counts(&self) -> (usize, usize, usize) {
        self.inner.extensions.counts()
    }

    async fn publish(&self, op: PublishOp, name: &str, value: Option<&Value>) {
        for publisher in self.inner.extensions.publishers() {
            if let Err(e) = publisher.publish(op, name, value).await {
                warn!(%op, name, error = %e, "Change publisher failed");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.extensions.detach_all();

        // A refresh nobody awaits any more would keep `Core` alive through its
        // own slot. One still awaited clears the slot when it settles.
        let mut slot = self.core.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot
            .as_ref()
            .is_some_and(|pending| pending.strong_count() == Some(1))
        {
            slot.take();
        }
    }
}

impl Core {
    fn current(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn refresh(self: &Arc<Self>) -> Result<Arc<Snapshot>> {
        let pending = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

            match slot.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight refresh");
                    pending.clone()
                }
                None => {
                    let core = Arc::clone(self);
                    let pending = async move { core.fetch_and_reconcile().await }
                        .boxed()
                        .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    async fn fetch_and_reconcile(&self) -> Result<Arc<Snapshot>> {
        debug!("Fetching snapshot from store");

        let outcome = match self.store.fetch_all().await {
            Ok(fetched) => Ok(self.reconcile(fetched)),
            Err(e) => {
                warn!(error = %e, "Refresh failed, keeping last known snapshot");
                Err(CacheError::from(e))
            }
        };

        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        outcome
    }

    /// Diffs the fetched values against the live snapshot, installs the next
    /// version if anything changed and emits `Changed` / `Refresh`.
    fn reconcile(&self, fetched: Values) -> Arc<Snapshot> {
        let current = self.current();
        let patch = diff::compare(current.values(), &fetched);

        let snapshot = if patch.is_empty() {
            current
        } else {
            let mut values = current.values().clone();
            if let Err(e) = diff::apply(&mut values, &patch) {
                warn!(error = %e, "Computed patch did not apply, adopting fetched values");
                values = fetched;
            }

            let next = Arc::new(current.next(values));
            *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);

            info!(
                version = next.version(),
                operations = patch.len(),
                "Snapshot updated"
            );
            next
        };

        self.populated.store(true, Ordering::SeqCst);

        if !patch.is_empty() {
            self.events.emit(CacheEvent::Changed {
                snapshot: Arc::clone(&snapshot),
                patch: patch.clone(),
            });
            snapshot.channel().emit(SnapshotChange {
                version: snapshot.version(),
                patch,
            });
        }

        self.events.emit(CacheEvent::Refresh {
            snapshot: Arc::clone(&snapshot),
        });

        snapshot
    }
}

impl fmt::Debug for RefreshHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RefreshHandle {
    /// Refreshes the coordinator behind this handle.
    ///
    /// # Errors
    /// * `CacheError::Closed` - If the coordinator has been dropped
    /// * `CacheError::Store` - If the fetch fails
    pub async fn refresh(&self) -> Result<Arc<Snapshot>> {
        let core = {
            let inner = self.inner.upgrade().ok_or(CacheError::Closed)?;
            Arc::clone(&inner.core)
        };

        core.refresh().await
    }

    /// Returns true once the coordinator has been dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

fn ensure_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CacheError::invalid_argument("name", "must not be empty"));
    }

    Ok(())
}
