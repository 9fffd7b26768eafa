//! confsync - a refreshing configuration cache.
//!
//! A [`RefreshCoordinator`] keeps an immutable, versioned [`Snapshot`] of the
//! key/value pairs held by a [`Store`](store::Store). Reads are served from the
//! snapshot; attached refresh policies decide when to go back to the store,
//! concurrent refreshes share a single fetch, and every refresh reports what
//! changed as a JSON patch.
//!
//! The main features include:
//!
//! - Reactive policies consulted on every read (always, never, stale-after)
//! - Proactive policies refreshing on their own (interval, file watch)
//! - Change publishers announcing local writes to other parties
//! - Broadcast notifications for writes, changes and refreshes
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use confsync::{RefreshCoordinator, policy::StaleRefresh, store::MemoryStore};
//! use serde_json::json;
//!
//! # async fn run() -> confsync::Result<()> {
//! let coordinator = RefreshCoordinator::new(Arc::new(MemoryStore::new()));
//! coordinator.with_extension(Arc::new(StaleRefresh::from_millis(1000)?))?;
//!
//! coordinator.write("theme", json!("dark")).await?;
//! assert_eq!(coordinator.read("theme").await?, Some(json!("dark")));
//! # Ok(())
//! # }
//! ```

/// Command-line interface over a settings-built coordinator.
pub mod cli;

/// The refresh coordinator and its snapshots.
pub mod coordinator;

/// Snapshot diffing and JSON-patch application.
pub mod diff;

/// Core error types and result aliases.
pub mod error;

/// Change notifications.
pub mod events;

/// Extension capability contracts.
pub mod extension;

/// Bundled refresh policies and publishers.
pub mod policy;

/// TOML settings for assembling a coordinator.
pub mod settings;

/// Backing store contract and bundled stores.
pub mod store;

/// Logging setup.
pub mod tracing_config;

/// Re-exported core types for convenience.
pub use coordinator::{CoordinatorBuilder, RefreshCoordinator, RefreshHandle, Snapshot};
pub use diff::{Patch, PatchOperation};
pub use error::{CacheError, Result};
pub use events::CacheEvent;
pub use extension::{ChangePublisher, Extension, ProactivePolicy, ReactivePolicy};
