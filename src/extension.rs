//! Capability contracts for refresh policies and change publishers, and the
//! registry the coordinator files registered extensions into.
//!
//! An extension is any type implementing [`Extension`]. It advertises which of
//! the three capabilities it provides by overriding the matching accessor;
//! registration asks each accessor once and wires the result.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{Result, coordinator::RefreshHandle};

/// A policy consulted before every read to decide whether to refresh.
pub trait ReactivePolicy: Send + Sync {
    /// Returns true if the cache should be refreshed now.
    fn should_refresh(&self) -> bool;
}

/// A policy that triggers refreshes on its own schedule.
pub trait ProactivePolicy: Send + Sync {
    /// Starts driving refreshes through `handle`.
    ///
    /// # Errors
    /// Returns `CacheError::AlreadySubscribed` if the policy already has a
    /// subscriber, or another error if its background work cannot start.
    fn subscribe(&self, handle: RefreshHandle) -> Result<()>;

    /// Stops triggering refreshes. Safe to call when not subscribed.
    fn unsubscribe(&self);
}

/// The kind of local mutation being published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOp {
    /// A key was written
    Set,
    /// A key was removed
    Delete,
}

impl fmt::Display for PublishOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishOp::Set => f.write_str("set"),
            PublishOp::Delete => f.write_str("delete"),
        }
    }
}

/// Errors a change publisher may report.
///
/// The coordinator logs these and carries on; a publisher can never fail a
/// write or remove.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PublishError {
    /// The publisher could not deliver the notification.
    #[error("{publisher} failed to publish: {details}")]
    Failed {
        /// Name of the publisher
        publisher: String,
        /// Failure details
        details: String,
    },
}

/// Receives local mutations so that other parties can be told out of band.
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    /// Publishes a mutation. `value` is `None` for deletes.
    ///
    /// # Errors
    /// Returns `PublishError` if delivery fails.
    async fn publish(
        &self,
        op: PublishOp,
        name: &str,
        value: Option<&Value>,
    ) -> std::result::Result<(), PublishError>;
}

/// An object that can be attached to a coordinator.
///
/// Override the accessor for each capability the type provides, returning
/// `Some(self)`. A type may provide any combination.
pub trait Extension: Send + Sync + 'static {
    /// Reactive refresh capability.
    fn reactive(self: Arc<Self>) -> Option<Arc<dyn ReactivePolicy>> {
        None
    }

    /// Proactive refresh capability.
    fn proactive(self: Arc<Self>) -> Option<Arc<dyn ProactivePolicy>> {
        None
    }

    /// Change publishing capability.
    fn publisher(self: Arc<Self>) -> Option<Arc<dyn ChangePublisher>> {
        None
    }
}

/// Registered extensions, filed by capability.
#[derive(Default)]
pub(crate) struct ExtensionRegistry {
    reactive: RwLock<Vec<Arc<dyn ReactivePolicy>>>,
    proactive: Mutex<Vec<Arc<dyn ProactivePolicy>>>,
    publishers: RwLock<Vec<Arc<dyn ChangePublisher>>>,
}

impl ExtensionRegistry {
    /// Files an extension by the capabilities it exposes.
    ///
    /// A proactive extension is subscribed before anything is filed, so one
    /// that refuses the subscription is not registered at all.
    pub(crate) fn register<E>(&self, extension: Arc<E>, handle: RefreshHandle) -> Result<()>
    where
        E: Extension + ?Sized,
    {
        let reactive = Arc::clone(&extension).reactive();
        let proactive = Arc::clone(&extension).proactive();
        let publisher = extension.publisher();

        debug!(
            reactive = reactive.is_some(),
            proactive = proactive.is_some(),
            publisher = publisher.is_some(),
            "Registering extension"
        );

        if let Some(policy) = proactive {
            policy.subscribe(handle)?;
            self.proactive
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(policy);
        }

        if let Some(policy) = reactive {
            self.reactive
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(policy);
        }

        if let Some(publisher) = publisher {
            self.publishers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(publisher);
        }

        Ok(())
    }

    /// Asks reactive policies in registration order, stopping at the first yes.
    pub(crate) fn should_refresh(&self) -> bool {
        self.reactive
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|policy| policy.should_refresh())
    }

    /// Snapshot of the publisher list, so no lock is held while publishing.
    pub(crate) fn publishers(&self) -> Vec<Arc<dyn ChangePublisher>> {
        self.publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Unsubscribes and forgets every proactive policy.
    pub(crate) fn detach_all(&self) {
        let policies: Vec<_> = self
            .proactive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for policy in policies {
            policy.unsubscribe();
        }
    }

    #[cfg(test)]
    pub(crate) fn counts(&self) -> (usize, usize, usize) {
        (
            self.reactive.read().unwrap_or_else(PoisonError::into_inner).len(),
            self.proactive.lock().unwrap_or_else(PoisonError::into_inner).len(),
            self.publishers.read().unwrap_or_else(PoisonError::into_inner).len(),
        )
    }
}
