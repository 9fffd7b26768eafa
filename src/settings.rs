//! TOML settings for assembling a coordinator.
//!
//! ```toml
//! [store]
//! kind = "file"
//! path = "settings.toml"
//!
//! [refresh]
//! policy = "stale"
//! stale_after_ms = 1000
//! watch_file = true
//! ```

use std::{fs, path::Path, path::PathBuf, sync::Arc};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::{
    CacheError, RefreshCoordinator, Result,
    coordinator::DEFAULT_EVENT_CAPACITY,
    policy::{AlwaysRefresh, FileWatchRefresh, IntervalRefresh, NeverRefresh, StaleRefresh},
    store::{MemoryStore, Store, TomlFileStore},
};

/// Top-level settings document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Settings {
    /// Which backing store to use.
    pub store: StoreSettings,

    /// When to refresh from the store.
    pub refresh: RefreshSettings,

    /// Notification channel tuning.
    pub events: EventSettings,
}

/// Backing store selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// In-process map, empty at startup.
    #[default]
    Memory,
    /// A TOML file on disk.
    File,
}

/// Store settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StoreSettings {
    /// Store implementation.
    pub kind: StoreKind,

    /// Path of the TOML file, required when `kind = "file"`.
    pub path: Option<PathBuf>,
}

/// Reactive or proactive policy selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Only the first read and post-write refreshes reach the store.
    #[default]
    Never,
    /// Every read reaches the store.
    Always,
    /// Reads refresh once the cache is older than `stale_after_ms`.
    Stale,
    /// A background task refreshes every `interval_ms`.
    Interval,
}

/// Refresh settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RefreshSettings {
    /// Refresh policy.
    pub policy: PolicyKind,

    /// Maximum cache age for the `stale` policy, in milliseconds.
    pub stale_after_ms: i64,

    /// Period of the `interval` policy, in milliseconds.
    pub interval_ms: i64,

    /// Also refresh whenever the store file changes (file stores only).
    pub watch_file: bool,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Never,
            stale_after_ms: 1000,
            interval_ms: 30_000,
            watch_file: false,
        }
    }
}

/// Notification channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EventSettings {
    /// Events buffered per subscriber before slow subscribers start lagging.
    pub capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Settings {
    /// Parses settings from a TOML string.
    ///
    /// # Errors
    /// * `CacheError::Settings` - If the TOML is malformed or has wrongly typed fields
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CacheError::Settings {
            details: e.to_string(),
        })
    }

    /// Loads settings from a TOML file.
    ///
    /// # Errors
    /// * `CacheError::Settings` - If the file cannot be read or parsed
    #[instrument]
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading settings from {}", path.display());

        let content = fs::read_to_string(path).map_err(|e| CacheError::Settings {
            details: format!("failed to read '{}': {e}", path.display()),
        })?;

        Self::from_toml_str(&content)
    }

    /// Builds a coordinator with the configured store and policies attached.
    ///
    /// Must be called from within a tokio runtime when a proactive policy
    /// (`interval` or `watch_file`) is configured.
    ///
    /// # Errors
    /// * `CacheError::MissingDependency` - If a file store has no path
    /// * `CacheError::InvalidArgument` - If a duration or capacity is not positive
    /// * `CacheError::Settings` - If `watch_file` is set without a file store
    /// * `CacheError::ServiceUnavailable` - If a proactive policy cannot start
    pub fn build(&self) -> Result<RefreshCoordinator> {
        let store = self.build_store()?;

        let coordinator = RefreshCoordinator::builder()
            .store(store)
            .event_capacity(self.events.capacity)
            .build()?;

        match self.refresh.policy {
            PolicyKind::Never => {
                coordinator.with_extension(Arc::new(NeverRefresh))?;
            }
            PolicyKind::Always => {
                coordinator.with_extension(Arc::new(AlwaysRefresh))?;
            }
            PolicyKind::Stale => {
                let policy = StaleRefresh::from_millis(self.refresh.stale_after_ms)?;
                coordinator.with_extension(Arc::new(policy))?;
            }
            PolicyKind::Interval => {
                let policy = IntervalRefresh::from_millis(self.refresh.interval_ms)?;
                coordinator.with_extension(Arc::new(policy))?;
            }
        }

        if self.refresh.watch_file {
            let path = self.file_path().ok_or_else(|| CacheError::Settings {
                details: "refresh.watch_file requires store.kind = \"file\"".to_string(),
            })??;
            coordinator.with_extension(Arc::new(FileWatchRefresh::new(path)))?;
        }

        debug!(policy = ?self.refresh.policy, store = ?self.store.kind, "Coordinator assembled");
        Ok(coordinator)
    }

    fn build_store(&self) -> Result<Arc<dyn Store>> {
        match self.file_path() {
            None => Ok(Arc::new(MemoryStore::new())),
            Some(path) => Ok(Arc::new(TomlFileStore::new(path?))),
        }
    }

    /// `None` for non-file stores, an error for a file store without a path.
    fn file_path(&self) -> Option<Result<PathBuf>> {
        match self.store.kind {
            StoreKind::Memory => None,
            StoreKind::File => Some(self.store.path.clone().ok_or_else(|| {
                CacheError::MissingDependency {
                    dependency: "store.path".to_string(),
                }
            })),
        }
    }
}

/// JSON schema of the settings document.
///
/// # Errors
/// * `CacheError::Settings` - If the schema cannot be serialized
pub fn schema() -> Result<String> {
    serde_json::to_string_pretty(&schemars::schema_for!(Settings)).map_err(|e| {
        CacheError::Settings {
            details: e.to_string(),
        }
    })
}
