use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;
use tracing::trace;

use super::{ensure_positive, positive_millis};
use crate::{
    Result,
    extension::{Extension, ReactivePolicy},
};

/// Refreshes on every read and write.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRefresh;

impl ReactivePolicy for AlwaysRefresh {
    fn should_refresh(&self) -> bool {
        true
    }
}

impl Extension for AlwaysRefresh {
    fn reactive(self: Arc<Self>) -> Option<Arc<dyn ReactivePolicy>> {
        Some(self)
    }
}

/// Never asks for a refresh.
///
/// This is also what a coordinator does with no reactive policy attached: only
/// the first read and the refresh following each write reach the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRefresh;

impl ReactivePolicy for NeverRefresh {
    fn should_refresh(&self) -> bool {
        false
    }
}

impl Extension for NeverRefresh {
    fn reactive(self: Arc<Self>) -> Option<Arc<dyn ReactivePolicy>> {
        Some(self)
    }
}

/// Refreshes when the last refresh it granted is at least `max_age` old.
///
/// The baseline is stamped only when the policy answers yes.
#[derive(Debug)]
pub struct StaleRefresh {
    max_age: Duration,
    last_granted: Mutex<Option<Instant>>,
}

impl StaleRefresh {
    /// Creates a policy with the given maximum age.
    ///
    /// # Errors
    /// * `CacheError::InvalidArgument` - If `max_age` is zero
    pub fn new(max_age: Duration) -> Result<Self> {
        Ok(Self {
            max_age: ensure_positive("max_age", max_age)?,
            last_granted: Mutex::new(None),
        })
    }

    /// Creates a policy from a millisecond count.
    ///
    /// # Errors
    /// * `CacheError::InvalidArgument` - If `millis` is not positive
    pub fn from_millis(millis: i64) -> Result<Self> {
        Self::new(positive_millis("max_age", millis)?)
    }

    /// The configured maximum age.
    pub fn max_age(&self) -> Duration {
        self.max_age
    }
}

impl ReactivePolicy for StaleRefresh {
    fn should_refresh(&self) -> bool {
        let mut last_granted = self
            .last_granted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        let due = match *last_granted {
            None => true,
            Some(at) => now.duration_since(at) >= self.max_age,
        };

        if due {
            *last_granted = Some(now);
        }

        trace!(due, "Stale refresh policy consulted");
        due
    }
}

impl Extension for StaleRefresh {
    fn reactive(self: Arc<Self>) -> Option<Arc<dyn ReactivePolicy>> {
        Some(self)
    }
}
