use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    CacheError, Result,
    coordinator::RefreshHandle,
    extension::{ChangePublisher, Extension, ProactivePolicy, PublishError, PublishOp},
};

/// Same-process pub/sub: a publisher and a proactive policy in one.
///
/// At most one coordinator may subscribe. Every publish refreshes that
/// subscriber and waits for it; the subscriber's errors are logged, never
/// returned. Attach [`LocalPubSub::publisher_half`] to the coordinators whose
/// writes should be announced.
#[derive(Debug, Default)]
pub struct LocalPubSub {
    subscriber: Mutex<Option<RefreshHandle>>,
}

impl LocalPubSub {
    /// Creates a pub/sub with no subscriber.
    pub fn new() -> Self {
        Self::default()
    }

    /// An extension exposing only the publishing side of this pub/sub.
    pub fn publisher_half(self: &Arc<Self>) -> Arc<LocalPublisher> {
        Arc::new(LocalPublisher(Arc::clone(self)))
    }

    /// Returns true while a subscriber is attached.
    pub fn has_subscriber(&self) -> bool {
        self.subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl ProactivePolicy for LocalPubSub {
    fn subscribe(&self, handle: RefreshHandle) -> Result<()> {
        let mut subscriber = self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if subscriber.is_some() {
            return Err(CacheError::already_subscribed("local pub/sub"));
        }

        *subscriber = Some(handle);
        Ok(())
    }

    fn unsubscribe(&self) {
        self.subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[async_trait]
impl ChangePublisher for LocalPubSub {
    async fn publish(
        &self,
        op: PublishOp,
        name: &str,
        _value: Option<&Value>,
    ) -> std::result::Result<(), PublishError> {
        let subscriber = self
            .subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(subscriber) = subscriber else {
            return Ok(());
        };

        debug!(%op, name, "Refreshing local subscriber");
        if let Err(e) = subscriber.refresh().await {
            warn!(%op, name, error = %e, "Local subscriber failed to refresh");
        }

        Ok(())
    }
}

impl Extension for LocalPubSub {
    fn proactive(self: Arc<Self>) -> Option<Arc<dyn ProactivePolicy>> {
        Some(self)
    }

    fn publisher(self: Arc<Self>) -> Option<Arc<dyn ChangePublisher>> {
        Some(self)
    }
}

/// The publishing side of a [`LocalPubSub`].
#[derive(Debug, Clone)]
pub struct LocalPublisher(Arc<LocalPubSub>);

#[async_trait]
impl ChangePublisher for LocalPublisher {
    async fn publish(
        &self,
        op: PublishOp,
        name: &str,
        value: Option<&Value>,
    ) -> std::result::Result<(), PublishError> {
        self.0.publish(op, name, value).await
    }
}

impl Extension for LocalPublisher {
    fn publisher(self: Arc<Self>) -> Option<Arc<dyn ChangePublisher>> {
        Some(self)
    }
}
