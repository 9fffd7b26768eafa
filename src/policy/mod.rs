//! Built-in refresh policies.
//!
//! Reactive policies are asked before every read whether the cache is due for
//! a refresh. Proactive policies hold a [`RefreshHandle`] and trigger
//! refreshes from a background task.
//!
//! [`RefreshHandle`]: crate::coordinator::RefreshHandle

mod file_watch;
mod interval;
mod local;
mod reactive;

use std::time::Duration;

use tokio::runtime;

pub use file_watch::FileWatchRefresh;
pub use interval::IntervalRefresh;
pub use local::{LocalPubSub, LocalPublisher};
pub use reactive::{AlwaysRefresh, NeverRefresh, StaleRefresh};

use crate::{CacheError, Result};

/// Converts a millisecond count from settings into a positive duration.
fn positive_millis(argument: &str, millis: i64) -> Result<Duration> {
    u64::try_from(millis)
        .ok()
        .filter(|millis| *millis > 0)
        .map(Duration::from_millis)
        .ok_or_else(|| {
            CacheError::invalid_argument(argument, format!("expected a positive number, got {millis}"))
        })
}

fn ensure_positive(argument: &str, duration: Duration) -> Result<Duration> {
    if duration.is_zero() {
        return Err(CacheError::invalid_argument(argument, "must be positive"));
    }

    Ok(duration)
}

/// The runtime background policy tasks are spawned on.
fn current_runtime(service: &str) -> Result<runtime::Handle> {
    runtime::Handle::try_current().map_err(|e| CacheError::ServiceUnavailable {
        service: service.to_string(),
        details: e.to_string(),
    })
}
