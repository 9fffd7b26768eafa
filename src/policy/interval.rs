use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use super::{current_runtime, ensure_positive, positive_millis};
use crate::{
    CacheError, Result,
    coordinator::RefreshHandle,
    extension::{Extension, ProactivePolicy},
};

/// Refreshes on a fixed period from a background task.
///
/// The first tick fires one period after subscribing. Failed refreshes are
/// logged and the ticker keeps going; it stops on `unsubscribe`, when the
/// policy is dropped, or once the coordinator is gone.
#[derive(Debug)]
pub struct IntervalRefresh {
    period: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IntervalRefresh {
    /// Creates a policy ticking every `period`.
    ///
    /// # Errors
    /// * `CacheError::InvalidArgument` - If `period` is zero
    pub fn new(period: Duration) -> Result<Self> {
        Ok(Self {
            period: ensure_positive("period", period)?,
            task: Mutex::new(None),
        })
    }

    /// Creates a policy from a millisecond period.
    ///
    /// # Errors
    /// * `CacheError::InvalidArgument` - If `millis` is not positive
    pub fn from_millis(millis: i64) -> Result<Self> {
        Self::new(positive_millis("period", millis)?)
    }

    /// The configured period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Returns true while a ticker task is attached.
    pub fn is_subscribed(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl ProactivePolicy for IntervalRefresh {
    fn subscribe(&self, handle: RefreshHandle) -> Result<()> {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return Err(CacheError::already_subscribed("interval refresh"));
        }

        let runtime = current_runtime("interval refresh")?;
        *task = Some(runtime.spawn(run_ticker(self.period, handle)));

        debug!(period_ms = self.period.as_millis(), "Interval refresh started");
        Ok(())
    }

    fn unsubscribe(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task {
            task.abort();
            debug!("Interval refresh stopped");
        }
    }
}

impl Extension for IntervalRefresh {
    fn proactive(self: Arc<Self>) -> Option<Arc<dyn ProactivePolicy>> {
        Some(self)
    }
}

impl Drop for IntervalRefresh {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

async fn run_ticker(period: Duration, handle: RefreshHandle) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match handle.refresh().await {
            Ok(snapshot) => debug!(version = snapshot.version(), "Interval refresh completed"),
            Err(CacheError::Closed) => {
                debug!("Coordinator dropped, stopping interval refresh");
                break;
            }
            Err(e) => warn!(error = %e, "Interval refresh failed"),
        }
    }
}
