use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher, recommended_watcher};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, warn};

use super::{current_runtime, ensure_positive};
use crate::{
    CacheError, Result,
    coordinator::RefreshHandle,
    extension::{Extension, ProactivePolicy},
};

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Refreshes whenever a file on disk changes.
///
/// The file's directory is watched rather than the file itself, so editors
/// and stores that replace the file through a rename are still noticed.
/// Bursts of events are debounced into a single refresh.
pub struct FileWatchRefresh {
    path: PathBuf,
    debounce: Duration,
    watch: Mutex<Option<ActiveWatch>>,
}

struct ActiveWatch {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl fmt::Debug for FileWatchRefresh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWatchRefresh")
            .field("path", &self.path)
            .field("debounce", &self.debounce)
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

impl FileWatchRefresh {
    /// Creates a policy watching `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            debounce: DEFAULT_DEBOUNCE,
            watch: Mutex::new(None),
        }
    }

    /// Overrides the debounce window.
    ///
    /// # Errors
    /// * `CacheError::InvalidArgument` - If `debounce` is zero
    pub fn with_debounce(mut self, debounce: Duration) -> Result<Self> {
        self.debounce = ensure_positive("debounce", debounce)?;
        Ok(self)
    }

    /// The watched file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true while the file is being watched.
    pub fn is_subscribed(&self) -> bool {
        self.watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl ProactivePolicy for FileWatchRefresh {
    fn subscribe(&self, handle: RefreshHandle) -> Result<()> {
        let mut watch = self.watch.lock().unwrap_or_else(PoisonError::into_inner);
        if watch.is_some() {
            return Err(CacheError::already_subscribed("file watch refresh"));
        }

        let runtime = current_runtime("file watcher")?;
        let (watcher, event_rx) = start_watcher(&self.path)?;
        let task = runtime.spawn(debounce_loop(event_rx, self.debounce, handle));

        *watch = Some(ActiveWatch {
            _watcher: watcher,
            task,
        });

        debug!(path = %self.path.display(), "Watching file for changes");
        Ok(())
    }

    fn unsubscribe(&self) {
        let watch = self
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(watch) = watch {
            watch.task.abort();
            debug!(path = %self.path.display(), "Stopped watching file");
        }
    }
}

impl Extension for FileWatchRefresh {
    fn proactive(self: Arc<Self>) -> Option<Arc<dyn ProactivePolicy>> {
        Some(self)
    }
}

impl Drop for FileWatchRefresh {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Starts a notify watcher on the file's directory and forwards events that
/// concern the file itself.
fn start_watcher(path: &Path) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<()>)> {
    let watch_error = |details: String| CacheError::ServiceUnavailable {
        service: "file watcher".to_string(),
        details,
    };

    let file_name: OsString = path
        .file_name()
        .ok_or_else(|| watch_error(format!("'{}' does not name a file", path.display())))?
        .to_os_string();

    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let mut watcher = recommended_watcher(move |res: notify::Result<Event>| {
        let Ok(event) = res else {
            return;
        };

        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }

        let concerns_file = event
            .paths
            .iter()
            .any(|changed| changed.file_name() == Some(file_name.as_os_str()));

        if concerns_file {
            let _ = event_tx.send(());
        }
    })
    .map_err(|e| watch_error(format!("failed to initialize: {e}")))?;

    watcher
        .watch(&directory, RecursiveMode::NonRecursive)
        .map_err(|e| watch_error(format!("failed to watch '{}': {e}", directory.display())))?;

    Ok((watcher, event_rx))
}

async fn debounce_loop(
    mut event_rx: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
    handle: RefreshHandle,
) {
    let debounce_sleep = time::sleep(debounce);
    tokio::pin!(debounce_sleep);

    let mut pending = false;

    loop {
        tokio::select! {
            Some(()) = event_rx.recv() => {
                pending = true;
                debounce_sleep.as_mut().reset(Instant::now() + debounce);
            }

            _ = &mut debounce_sleep, if pending => {
                pending = false;

                match handle.refresh().await {
                    Ok(snapshot) => debug!(version = snapshot.version(), "Refreshed after file change"),
                    Err(CacheError::Closed) => break,
                    Err(e) => warn!(error = %e, "Refresh after file change failed"),
                }
            }

            else => break,
        }
    }
}
