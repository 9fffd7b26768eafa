//! Unit tests for the coordinator.
//! In-memory stores only; time-based tests run on a paused clock.

#![allow(clippy::panic)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, future};
use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast::error::TryRecvError};

use super::*;
use crate::{
    diff::PatchOperation,
    extension::{ChangePublisher, PublishError, PublishOp},
    policy::{AlwaysRefresh, IntervalRefresh, LocalPubSub, NeverRefresh, StaleRefresh},
    store::{MemoryStore, StoreError, StoreOperation},
};

fn values(json: Value) -> Values {
    match json {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// A store that records mutations and can be told to stall or fail fetches.
#[derive(Default)]
struct ScriptedStore {
    values: Mutex<Values>,
    fetches: AtomicUsize,
    fail_fetch: AtomicBool,
    failing_keys: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Notify>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedStore {
    fn with_values(json: Value) -> Arc<Self> {
        let store = Self::default();
        *store.values.lock().unwrap() = values(json);
        Arc::new(store)
    }

    fn set_values(&self, json: Value) {
        *self.values.lock().unwrap() = values(json);
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn stall_fetches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    fn fail_key(&self, key: &str) {
        self.failing_keys.lock().unwrap().push(key.to_string());
    }

    fn check_key(
        &self,
        operation: StoreOperation,
        key: &str,
    ) -> std::result::Result<(), StoreError> {
        if self.failing_keys.lock().unwrap().iter().any(|k| k == key) {
            return Err(StoreError::backend(operation, format!("{key} is read-only")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for ScriptedStore {
    async fn fetch_all(&self) -> std::result::Result<Values, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(StoreError::backend(StoreOperation::Fetch, "offline"));
        }

        Ok(self.values.lock().unwrap().clone())
    }

    async fn write(&self, name: &str, value: &Value) -> std::result::Result<(), StoreError> {
        self.check_key(StoreOperation::Write, name)?;
        self.calls.lock().unwrap().push(format!("write {name}={value}"));
        self.values
            .lock()
            .unwrap()
            .insert(name.to_string(), value.clone());
        Ok(())
    }

    async fn remove(&self, name: &str) -> std::result::Result<(), StoreError> {
        self.check_key(StoreOperation::Remove, name)?;
        self.calls.lock().unwrap().push(format!("remove {name}"));
        self.values.lock().unwrap().remove(name);
        Ok(())
    }
}

struct ReadOnlyStore;

#[async_trait]
impl Store for ReadOnlyStore {
    async fn fetch_all(&self) -> std::result::Result<Values, StoreError> {
        Ok(Values::new())
    }
}

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<(PublishOp, String, Option<Value>)>>,
}

#[async_trait]
impl ChangePublisher for RecordingPublisher {
    async fn publish(
        &self,
        op: PublishOp,
        name: &str,
        value: Option<&Value>,
    ) -> std::result::Result<(), PublishError> {
        self.published
            .lock()
            .unwrap()
            .push((op, name.to_string(), value.cloned()));
        Ok(())
    }
}

impl Extension for RecordingPublisher {
    fn publisher(self: Arc<Self>) -> Option<Arc<dyn ChangePublisher>> {
        Some(self)
    }
}

struct FailingPublisher;

#[async_trait]
impl ChangePublisher for FailingPublisher {
    async fn publish(
        &self,
        _op: PublishOp,
        _name: &str,
        _value: Option<&Value>,
    ) -> std::result::Result<(), PublishError> {
        Err(PublishError::Failed {
            publisher: "failing".to_string(),
            details: "broker unreachable".to_string(),
        })
    }
}

impl Extension for FailingPublisher {
    fn publisher(self: Arc<Self>) -> Option<Arc<dyn ChangePublisher>> {
        Some(self)
    }
}

fn drain(rx: &mut broadcast::Receiver<CacheEvent>) -> Vec<CacheEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty) => return events,
            Err(e) => panic!("unexpected receive error: {e}"),
        }
    }
}

fn names(events: &[CacheEvent]) -> Vec<&'static str> {
    events.iter().map(CacheEvent::name).collect()
}

#[tokio::test]
async fn first_read_fetches_regardless_of_policy() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    let coordinator = RefreshCoordinator::new(store.clone());
    coordinator.with_extension(Arc::new(NeverRefresh)).unwrap();

    assert!(!coordinator.is_populated());
    assert_eq!(coordinator.read("a").await.unwrap(), Some(json!(1)));
    assert!(coordinator.is_populated());
    assert_eq!(store.fetches(), 1);
}

#[tokio::test]
async fn absent_key_reads_as_none() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    let coordinator = RefreshCoordinator::new(store);

    assert_eq!(coordinator.read("missing").await.unwrap(), None);
}

#[tokio::test]
async fn empty_name_is_rejected_without_fetching() {
    let store = ScriptedStore::with_values(json!({}));
    let coordinator = RefreshCoordinator::new(store.clone());

    for result in [
        coordinator.read("").await.map(|_| ()),
        coordinator.write("", json!(1)).await.map(|_| ()),
        coordinator.remove("").await.map(|_| ()),
    ] {
        assert!(matches!(result, Err(CacheError::InvalidArgument { .. })));
    }

    assert_eq!(store.fetches(), 0);
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn never_policy_only_fetches_once() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    let coordinator = RefreshCoordinator::new(store.clone());
    coordinator.with_extension(Arc::new(NeverRefresh)).unwrap();

    coordinator.read("a").await.unwrap();
    coordinator.read("a").await.unwrap();
    coordinator.read("a").await.unwrap();

    assert_eq!(store.fetches(), 1);
}

#[tokio::test]
async fn no_policy_behaves_like_never() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    let coordinator = RefreshCoordinator::new(store.clone());

    coordinator.read_all().await.unwrap();
    coordinator.read_all().await.unwrap();

    assert_eq!(store.fetches(), 1);
}

#[tokio::test]
async fn always_policy_fetches_on_every_read() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    let coordinator = RefreshCoordinator::new(store.clone());
    coordinator.with_extension(Arc::new(AlwaysRefresh)).unwrap();

    coordinator.read("a").await.unwrap();
    assert_eq!(store.fetches(), 1);

    coordinator.read("a").await.unwrap();
    coordinator.read("a").await.unwrap();
    assert_eq!(store.fetches(), 3);
}

#[tokio::test]
async fn any_reactive_policy_can_trigger_refresh() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    let coordinator = RefreshCoordinator::new(store.clone());
    coordinator
        .with_extension(Arc::new(NeverRefresh))
        .unwrap()
        .with_extension(Arc::new(AlwaysRefresh))
        .unwrap();

    coordinator.read("a").await.unwrap();
    coordinator.read("a").await.unwrap();

    assert_eq!(store.fetches(), 2);
    assert_eq!(coordinator.extension_counts(), (2, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn stale_policy_gates_reads_by_age() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    let coordinator = RefreshCoordinator::new(store.clone());
    coordinator
        .with_extension(Arc::new(StaleRefresh::from_millis(1000).unwrap()))
        .unwrap();

    // First read bypasses the policy; the second is its first consultation.
    coordinator.read("a").await.unwrap();
    coordinator.read("a").await.unwrap();
    assert_eq!(store.fetches(), 2);

    coordinator.read("a").await.unwrap();
    assert_eq!(store.fetches(), 2);

    tokio::time::advance(Duration::from_millis(1000)).await;
    coordinator.read("a").await.unwrap();
    assert_eq!(store.fetches(), 3);
}

#[tokio::test]
async fn concurrent_refreshes_share_one_fetch() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    let gate = store.stall_fetches();
    let coordinator = RefreshCoordinator::new(store.clone());

    let refreshes = future::join_all((0..5).map(|_| coordinator.refresh()));
    let release = async {
        tokio::task::yield_now().await;
        gate.notify_one();
    };
    let (results, ()) = tokio::join!(refreshes, release);

    assert_eq!(store.fetches(), 1);

    let snapshots: Vec<Arc<Snapshot>> = results.into_iter().map(|r| r.unwrap()).collect();
    for snapshot in &snapshots[1..] {
        assert!(Arc::ptr_eq(&snapshots[0], snapshot));
    }
    assert_eq!(snapshots[0].get("a"), Some(&json!(1)));
}

#[tokio::test]
async fn concurrent_first_reads_share_one_fetch() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    let gate = store.stall_fetches();
    let coordinator = RefreshCoordinator::new(store.clone());

    let reads = future::join_all((0..3).map(|_| coordinator.read("a")));
    let release = async {
        tokio::task::yield_now().await;
        gate.notify_one();
    };
    let (results, ()) = tokio::join!(reads, release);

    assert_eq!(store.fetches(), 1);
    for result in results {
        assert_eq!(result.unwrap(), Some(json!(1)));
    }
}

#[tokio::test]
async fn refresh_after_coalesced_fetch_starts_a_new_one() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    let coordinator = RefreshCoordinator::new(store.clone());

    coordinator.refresh().await.unwrap();
    coordinator.refresh().await.unwrap();

    assert_eq!(store.fetches(), 2);
}

#[tokio::test]
async fn unchanged_store_emits_only_refresh() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    let coordinator = RefreshCoordinator::new(store);

    let first = coordinator.refresh().await.unwrap();
    let mut rx = coordinator.subscribe();
    let second = coordinator.refresh().await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(names(&drain(&mut rx)), vec!["refresh"]);
}

#[tokio::test]
async fn changed_event_carries_the_diff() {
    let store = ScriptedStore::with_values(json!({ "foo": "bar" }));
    let coordinator = RefreshCoordinator::new(store.clone());
    coordinator.refresh().await.unwrap();

    store.set_values(json!({ "foo": "bar", "hello": "world" }));
    let mut rx = coordinator.subscribe();
    let snapshot = coordinator.refresh().await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(names(&events), vec!["changed", "refresh"]);

    let CacheEvent::Changed { patch, snapshot: changed } = &events[0] else {
        panic!("expected a changed event");
    };
    assert_eq!(
        patch,
        &Patch::from(vec![PatchOperation::Add {
            path: "/hello".to_string(),
            value: json!("world"),
        }])
    );
    assert!(Arc::ptr_eq(changed, &snapshot));
}

#[tokio::test]
async fn snapshots_are_versioned_and_immutable() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    let coordinator = RefreshCoordinator::new(store.clone());

    let before = coordinator.read_all().await.unwrap();
    store.set_values(json!({ "a": 2 }));
    let after = coordinator.refresh().await.unwrap();

    assert_eq!(before.get("a"), Some(&json!(1)));
    assert_eq!(after.get("a"), Some(&json!(2)));
    assert_eq!(after.version(), before.version() + 1);
    assert!(Arc::ptr_eq(&coordinator.current(), &after));
}

#[tokio::test]
async fn failed_refresh_keeps_snapshot_and_emits_nothing() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    let coordinator = RefreshCoordinator::new(store.clone());
    let before = coordinator.refresh().await.unwrap();

    store.fail_fetch.store(true, Ordering::SeqCst);
    store.set_values(json!({ "a": 2 }));
    let mut rx = coordinator.subscribe();

    let err = coordinator.refresh().await.unwrap_err();
    assert_eq!(
        err,
        CacheError::Store(StoreError::backend(StoreOperation::Fetch, "offline"))
    );
    assert!(Arc::ptr_eq(&coordinator.current(), &before));
    assert!(drain(&mut rx).is_empty());

    store.fail_fetch.store(false, Ordering::SeqCst);
    let recovered = coordinator.refresh().await.unwrap();
    assert_eq!(recovered.get("a"), Some(&json!(2)));
}

#[tokio::test]
async fn failed_first_fetch_is_retried_on_next_read() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    store.fail_fetch.store(true, Ordering::SeqCst);
    let coordinator = RefreshCoordinator::new(store.clone());
    coordinator.with_extension(Arc::new(NeverRefresh)).unwrap();

    assert!(coordinator.read("a").await.is_err());
    assert!(!coordinator.is_populated());

    store.fail_fetch.store(false, Ordering::SeqCst);
    assert_eq!(coordinator.read("a").await.unwrap(), Some(json!(1)));
    assert_eq!(store.fetches(), 2);
}

#[tokio::test]
async fn write_hits_store_then_emits_and_refreshes() {
    let store = ScriptedStore::with_values(json!({ "foo": "bar" }));
    let coordinator = RefreshCoordinator::new(store.clone());
    coordinator.read("foo").await.unwrap();

    let mut rx = coordinator.subscribe();
    let snapshot = coordinator.write("foo", json!("baz")).await.unwrap();

    assert_eq!(store.calls(), vec![r#"write foo="baz""#.to_string()]);
    assert_eq!(store.fetches(), 2);
    assert_eq!(snapshot.get("foo"), Some(&json!("baz")));

    let events = drain(&mut rx);
    assert_eq!(names(&events), vec!["set", "changed", "refresh"]);
    let CacheEvent::Set { name, value } = &events[0] else {
        panic!("expected a set event");
    };
    assert_eq!(name, "foo");
    assert_eq!(value, &json!("baz"));
}

#[tokio::test]
async fn remove_emits_delete_before_refresh() {
    let store = ScriptedStore::with_values(json!({ "foo": "bar" }));
    let coordinator = RefreshCoordinator::new(store.clone());
    coordinator.read_all().await.unwrap();

    let mut rx = coordinator.subscribe();
    let snapshot = coordinator.remove("foo").await.unwrap();

    assert_eq!(store.calls(), vec!["remove foo".to_string()]);
    assert!(!snapshot.contains_key("foo"));
    assert_eq!(names(&drain(&mut rx)), vec!["delete", "changed", "refresh"]);
}

#[tokio::test]
async fn rejected_write_emits_nothing_and_skips_refresh() {
    let store = ScriptedStore::with_values(json!({ "locked": true }));
    store.fail_key("locked");
    let coordinator = RefreshCoordinator::new(store.clone());
    coordinator.read_all().await.unwrap();

    let mut rx = coordinator.subscribe();
    let err = coordinator.write("locked", json!(false)).await.unwrap_err();

    assert!(matches!(err, CacheError::Store(StoreError::Backend { .. })));
    assert!(drain(&mut rx).is_empty());
    assert_eq!(store.fetches(), 1);
}

#[tokio::test]
async fn write_on_read_only_store_is_unsupported() {
    let coordinator = RefreshCoordinator::new(Arc::new(ReadOnlyStore));

    let err = coordinator.write("a", json!(1)).await.unwrap_err();

    assert_eq!(
        err,
        CacheError::Store(StoreError::Unsupported {
            operation: StoreOperation::Write
        })
    );
}

#[tokio::test]
async fn apply_patch_derives_writes_and_removes() {
    let store = ScriptedStore::with_values(json!({ "y": 2 }));
    let coordinator = RefreshCoordinator::new(store.clone());

    let patch: Patch = serde_json::from_value(json!([
        { "op": "add", "path": "/x", "value": 1 },
        { "op": "remove", "path": "/y" },
    ]))
    .unwrap();
    coordinator.apply_patch(&patch).await.unwrap();

    let mut calls = store.calls();
    calls.sort();
    assert_eq!(calls, vec!["remove y".to_string(), "write x=1".to_string()]);

    let snapshot = coordinator.current();
    assert_eq!(snapshot.get("x"), Some(&json!(1)));
    assert!(!snapshot.contains_key("y"));
}

#[tokio::test]
async fn apply_patch_writes_whole_top_level_value() {
    let store = ScriptedStore::with_values(json!({ "db": { "host": "a", "port": 1 } }));
    let coordinator = RefreshCoordinator::new(store.clone());

    let patch = Patch::from(vec![
        PatchOperation::Replace {
            path: "/db/port".to_string(),
            value: json!(2),
        },
        PatchOperation::Add {
            path: "/db/user".to_string(),
            value: json!("admin"),
        },
    ]);
    coordinator.apply_patch(&patch).await.unwrap();

    assert_eq!(
        store.calls(),
        vec![r#"write db={"host":"a","port":2,"user":"admin"}"#.to_string()]
    );
}

#[tokio::test]
async fn apply_patch_skips_keys_absent_before_and_after() {
    let store = ScriptedStore::with_values(json!({}));
    let coordinator = RefreshCoordinator::new(store.clone());

    let patch = Patch::from(vec![
        PatchOperation::Add {
            path: "/tmp".to_string(),
            value: json!(1),
        },
        PatchOperation::Remove {
            path: "/tmp".to_string(),
        },
    ]);
    coordinator.apply_patch(&patch).await.unwrap();

    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn apply_patch_reports_failed_keys() {
    let store = ScriptedStore::with_values(json!({ "locked": 1 }));
    store.fail_key("locked");
    let coordinator = RefreshCoordinator::new(store.clone());

    let patch = Patch::from(vec![
        PatchOperation::Replace {
            path: "/locked".to_string(),
            value: json!(2),
        },
        PatchOperation::Add {
            path: "/open".to_string(),
            value: json!(true),
        },
    ]);
    let err = coordinator.apply_patch(&patch).await.unwrap_err();

    let CacheError::PatchApply { failures } = err else {
        panic!("expected an aggregate failure, got {err:?}");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].key, "locked");
    assert_eq!(store.calls(), vec!["write open=true".to_string()]);
}

#[tokio::test]
async fn apply_patch_skips_removes_of_absent_keys() {
    let store = ScriptedStore::with_values(json!({ "x": 0 }));
    let coordinator = RefreshCoordinator::new(store.clone());

    let patch = Patch::from(vec![
        PatchOperation::Add {
            path: "/x".to_string(),
            value: json!(1),
        },
        PatchOperation::Remove {
            path: "/y".to_string(),
        },
    ]);
    coordinator.apply_patch(&patch).await.unwrap();

    assert_eq!(store.calls(), vec!["write x=1".to_string()]);
    assert_eq!(coordinator.current().get("x"), Some(&json!(1)));
}

#[tokio::test]
async fn apply_patch_replays_nested_changes_onto_missing_keys() {
    let store = ScriptedStore::with_values(json!({}));
    let coordinator = RefreshCoordinator::new(store.clone());

    let patch = Patch::from(vec![
        PatchOperation::Replace {
            path: "/db/port".to_string(),
            value: json!(5432),
        },
        PatchOperation::Remove {
            path: "/cache/ttl".to_string(),
        },
    ]);
    coordinator.apply_patch(&patch).await.unwrap();

    assert_eq!(store.calls(), vec![r#"write db={"port":5432}"#.to_string()]);
}

#[tokio::test]
async fn apply_patch_rejects_malformed_paths() {
    let store = ScriptedStore::with_values(json!({}));
    let coordinator = RefreshCoordinator::new(store.clone());

    let patch = Patch::from(vec![PatchOperation::Remove {
        path: "missing".to_string(),
    }]);
    let err = coordinator.apply_patch(&patch).await.unwrap_err();

    assert!(matches!(err, CacheError::InvalidPatch(_)));
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn empty_patch_does_nothing() {
    let store = ScriptedStore::with_values(json!({}));
    let coordinator = RefreshCoordinator::new(store.clone());

    coordinator.apply_patch(&Patch::new()).await.unwrap();

    assert_eq!(store.fetches(), 0);
}

#[test]
fn builder_requires_a_store() {
    let err = RefreshCoordinator::builder().build().err().unwrap();
    assert_eq!(
        err,
        CacheError::MissingDependency {
            dependency: "store".to_string()
        }
    );
}

#[test]
fn builder_rejects_zero_capacity() {
    let err = RefreshCoordinator::builder()
        .store(Arc::new(MemoryStore::new()))
        .event_capacity(0)
        .build()
        .err()
        .unwrap();

    assert!(matches!(err, CacheError::InvalidArgument { .. }));
}

#[test]
fn missing_extension_is_ignored() {
    let coordinator = RefreshCoordinator::new(Arc::new(MemoryStore::new()));

    coordinator
        .with_extension(None::<Arc<AlwaysRefresh>>)
        .unwrap();

    assert_eq!(coordinator.extension_counts(), (0, 0, 0));
}

#[test]
fn refused_subscription_registers_nothing() {
    let pubsub = Arc::new(LocalPubSub::new());
    let first = RefreshCoordinator::new(Arc::new(MemoryStore::new()));
    let second = RefreshCoordinator::new(Arc::new(MemoryStore::new()));

    first.with_extension(Arc::clone(&pubsub)).unwrap();
    assert_eq!(first.extension_counts(), (0, 1, 1));

    let err = second.with_extension(Arc::clone(&pubsub)).err().unwrap();
    assert!(matches!(err, CacheError::AlreadySubscribed { .. }));
    assert_eq!(second.extension_counts(), (0, 0, 0));
}

#[tokio::test]
async fn publishers_see_writes_and_removes() {
    let store = ScriptedStore::with_values(json!({}));
    let coordinator = RefreshCoordinator::new(store);
    let publisher = Arc::new(RecordingPublisher::default());
    coordinator.with_extension(Arc::clone(&publisher)).unwrap();

    coordinator.write("a", json!(1)).await.unwrap();
    coordinator.remove("a").await.unwrap();

    assert_eq!(
        *publisher.published.lock().unwrap(),
        vec![
            (PublishOp::Set, "a".to_string(), Some(json!(1))),
            (PublishOp::Delete, "a".to_string(), None),
        ]
    );
}

#[tokio::test]
async fn publisher_failure_does_not_fail_write() {
    let store = ScriptedStore::with_values(json!({}));
    let coordinator = RefreshCoordinator::new(store.clone());
    let recorder = Arc::new(RecordingPublisher::default());
    coordinator
        .with_extension(Arc::new(FailingPublisher))
        .unwrap()
        .with_extension(Arc::clone(&recorder))
        .unwrap();

    let snapshot = coordinator.write("a", json!(1)).await.unwrap();

    assert_eq!(snapshot.get("a"), Some(&json!(1)));
    assert_eq!(recorder.published.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn local_pubsub_refreshes_the_subscriber() {
    let store = Arc::new(MemoryStore::new());
    let reader = RefreshCoordinator::new(store.clone());
    let writer = RefreshCoordinator::new(store.clone());

    let pubsub = Arc::new(LocalPubSub::new());
    reader
        .with_extension(Arc::new(NeverRefresh))
        .unwrap()
        .with_extension(Arc::clone(&pubsub))
        .unwrap();
    writer.with_extension(pubsub.publisher_half()).unwrap();

    assert_eq!(reader.read("theme").await.unwrap(), None);

    writer.write("theme", json!("dark")).await.unwrap();

    assert_eq!(reader.current().get("theme"), Some(&json!("dark")));
    assert_eq!(reader.read("theme").await.unwrap(), Some(json!("dark")));
}

#[tokio::test]
async fn local_pubsub_swallows_subscriber_failures() {
    let failing = ScriptedStore::with_values(json!({}));
    failing.fail_fetch.store(true, Ordering::SeqCst);
    let reader = RefreshCoordinator::new(failing);

    let pubsub = Arc::new(LocalPubSub::new());
    reader.with_extension(Arc::clone(&pubsub)).unwrap();

    let writer = RefreshCoordinator::new(Arc::new(MemoryStore::new()));
    writer.with_extension(pubsub.publisher_half()).unwrap();

    assert!(writer.write("a", json!(1)).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn interval_policy_refreshes_in_background() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = RefreshCoordinator::new(store.clone());
    coordinator
        .with_extension(Arc::new(IntervalRefresh::from_millis(1000).unwrap()))
        .unwrap();
    coordinator.read_all().await.unwrap();

    store.insert("a", json!(1));
    let mut stream = Box::pin(coordinator.watch_keys("a"));
    let start = tokio::time::Instant::now();

    let event = stream.next().await.unwrap();

    assert!(matches!(event, CacheEvent::Changed { .. }));
    assert!(start.elapsed() >= Duration::from_millis(1000));
    assert_eq!(coordinator.current().get("a"), Some(&json!(1)));
}

#[tokio::test(start_paused = true)]
async fn interval_policy_survives_failed_refreshes() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    store.fail_fetch.store(true, Ordering::SeqCst);
    let coordinator = RefreshCoordinator::new(store.clone());
    coordinator
        .with_extension(Arc::new(IntervalRefresh::from_millis(100).unwrap()))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(store.fetches(), 3);
    assert!(!coordinator.is_populated());

    store.fail_fetch.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(coordinator.is_populated());
}

#[tokio::test(start_paused = true)]
async fn detach_stops_proactive_policies() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = RefreshCoordinator::new(store.clone());
    let policy = Arc::new(IntervalRefresh::from_millis(100).unwrap());
    coordinator.with_extension(Arc::clone(&policy)).unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(store.fetch_count(), 2);

    coordinator.detach_proactive();
    assert!(!policy.is_subscribed());
    assert_eq!(coordinator.extension_counts(), (0, 0, 0));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.fetch_count(), 2);
}

#[tokio::test]
async fn dropping_coordinator_unsubscribes_policies() {
    let coordinator = RefreshCoordinator::new(Arc::new(MemoryStore::new()));
    let policy = Arc::new(IntervalRefresh::from_millis(1000).unwrap());
    coordinator.with_extension(Arc::clone(&policy)).unwrap();

    let clone = coordinator.clone();
    drop(coordinator);
    assert!(policy.is_subscribed());

    drop(clone);
    assert!(!policy.is_subscribed());
}

#[tokio::test]
async fn handle_reports_closed_coordinator() {
    let coordinator = RefreshCoordinator::new(Arc::new(MemoryStore::new()));
    let handle = coordinator.handle();

    assert!(!handle.is_closed());
    handle.refresh().await.unwrap();
    assert!(coordinator.is_populated());

    drop(coordinator);
    assert!(handle.is_closed());
    assert_eq!(handle.refresh().await.unwrap_err(), CacheError::Closed);
}

#[tokio::test]
async fn dropping_coordinator_keeps_awaited_refresh_shared() {
    let store = ScriptedStore::with_values(json!({ "a": 1 }));
    let coordinator = RefreshCoordinator::new(store.clone());
    let core = Arc::clone(&coordinator.inner.core);
    let gate = store.stall_fetches();

    let handle = coordinator.handle();
    let first = tokio::spawn(async move { handle.refresh().await });
    while store.fetches() == 0 {
        tokio::task::yield_now().await;
    }
    drop(coordinator);

    let release = async {
        tokio::task::yield_now().await;
        gate.notify_one();
    };
    let (second, ()) = tokio::time::timeout(
        Duration::from_secs(5),
        async { tokio::join!(core.refresh(), release) },
    )
    .await
    .unwrap();

    let first = first.await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second.unwrap()));
    assert_eq!(store.fetches(), 1);
}

#[tokio::test]
async fn snapshot_channel_outlives_the_version() {
    let store = Arc::new(MemoryStore::with_values(values(json!({ "a": 1 }))));
    let coordinator = RefreshCoordinator::new(store.clone());

    let snapshot = coordinator.read_all().await.unwrap();
    let mut changes = Box::pin(snapshot.watch());

    store.insert("b", json!(2));
    coordinator.refresh().await.unwrap();

    let change = changes.next().await.unwrap();
    assert_eq!(change.version, snapshot.version() + 1);
    assert!(change.patch.touches("b"));
    assert!(!snapshot.contains_key("b"));
}

#[tokio::test]
async fn watch_keys_filters_by_pattern() {
    let coordinator = RefreshCoordinator::new(Arc::new(MemoryStore::new()));
    let mut stream = Box::pin(coordinator.watch_keys("db.*"));

    coordinator.write("log", json!("debug")).await.unwrap();
    coordinator
        .write("db", json!({ "port": 5432 }))
        .await
        .unwrap();

    let first = stream.next().await.unwrap();
    let CacheEvent::Set { name, .. } = first else {
        panic!("expected a set event, got {first:?}");
    };
    assert_eq!(name, "db");

    let second = stream.next().await.unwrap();
    let CacheEvent::Changed { patch, .. } = second else {
        panic!("expected a changed event, got {second:?}");
    };
    assert!(patch.touches("db"));
}

#[tokio::test]
async fn events_stream_sees_every_event() {
    let coordinator = RefreshCoordinator::new(Arc::new(MemoryStore::new()));
    let stream = coordinator.events();

    coordinator.write("a", json!(1)).await.unwrap();

    let events: Vec<CacheEvent> = stream.take(3).collect().await;
    assert_eq!(names(&events), vec!["set", "changed", "refresh"]);
}
