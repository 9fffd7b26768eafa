//! Backing store contract and bundled adapters.
//!
//! The coordinator only ever talks to a [`Store`]: it fetches the complete
//! key/value mapping and, for stores that support it, writes or removes single
//! top-level keys.

mod file;
mod memory;

use std::{fmt, path::PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};

pub use file::TomlFileStore;
pub use memory::MemoryStore;

/// The key/value mapping a store hands back on every fetch.
pub type Values = Map<String, Value>;

/// A backing store the cache refreshes from.
///
/// Only [`Store::fetch_all`] is required. Read-only stores leave `write` and
/// `remove` at their defaults, which report [`StoreError::Unsupported`];
/// calling them is a wiring mistake rather than a transient failure.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetches every key currently held by the store.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    async fn fetch_all(&self) -> Result<Values, StoreError>;

    /// Persists a single top-level key.
    ///
    /// # Errors
    /// Returns `StoreError::Unsupported` unless the store overrides it.
    async fn write(&self, _name: &str, _value: &Value) -> Result<(), StoreError> {
        Err(StoreError::Unsupported {
            operation: StoreOperation::Write,
        })
    }

    /// Deletes a single top-level key.
    ///
    /// # Errors
    /// Returns `StoreError::Unsupported` unless the store overrides it.
    async fn remove(&self, _name: &str) -> Result<(), StoreError> {
        Err(StoreError::Unsupported {
            operation: StoreOperation::Remove,
        })
    }
}

/// The store operation an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    /// `fetch_all`
    Fetch,
    /// `write`
    Write,
    /// `remove`
    Remove,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOperation::Fetch => "fetch",
            StoreOperation::Write => "write",
            StoreOperation::Remove => "remove",
        };
        f.write_str(name)
    }
}

/// Errors reported by store adapters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The store does not implement the requested operation.
    #[error("store does not support {operation}")]
    Unsupported {
        /// The operation that was attempted
        operation: StoreOperation,
    },

    /// The backend rejected or failed the operation.
    #[error("store {operation} failed: {details}")]
    Backend {
        /// The operation that failed
        operation: StoreOperation,
        /// Backend error details
        details: String,
    },

    /// Error occurred during file I/O operations
    #[error("I/O error on '{path}': {details}")]
    Io {
        /// Path where I/O error occurred
        path: PathBuf,
        /// I/O error details
        details: String,
    },

    /// Stored content could not be parsed
    #[error("failed to parse {location}: {details}")]
    Parse {
        /// Location of the content (file path, "string", etc.)
        location: String,
        /// Parse error details
        details: String,
    },

    /// A value cannot be represented in the store's format
    #[error("failed to serialize '{key}': {details}")]
    Serialization {
        /// Key whose value failed to serialize
        key: String,
        /// Serialization error details
        details: String,
    },
}

impl StoreError {
    /// Creates a backend error for the given operation.
    pub fn backend(operation: StoreOperation, details: impl fmt::Display) -> Self {
        StoreError::Backend {
            operation,
            details: details.to_string(),
        }
    }
}
