use std::{fmt, result};

use thiserror::Error;

use crate::{diff::PatchError, store::StoreError};

/// Errors that can occur while reading, writing or refreshing the cache.
///
/// The type is `Clone` because a single failed fetch is reported to every
/// caller that joined the same in-flight refresh.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// An argument was rejected before any I/O took place.
    #[error("invalid argument '{argument}': {reason}")]
    InvalidArgument {
        /// Name of the rejected argument
        argument: String,
        /// Why the argument was rejected
        reason: String,
    },

    /// A proactive policy or publisher already has a subscriber.
    #[error("{extension} is already subscribed")]
    AlreadySubscribed {
        /// Name of the extension that refused the subscription
        extension: String,
    },

    /// A required collaborator was not supplied at construction.
    #[error("missing dependency: {dependency}")]
    MissingDependency {
        /// The collaborator that was not provided
        dependency: String,
    },

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A caller-supplied patch could not be applied to the current snapshot.
    #[error(transparent)]
    InvalidPatch(#[from] PatchError),

    /// One or more keys derived from a patch failed to persist.
    #[error("patch failed for {} key(s): {}", .failures.len(), join_failures(.failures))]
    PatchApply {
        /// Every key that failed, in patch order
        failures: Vec<KeyFailure>,
    },

    /// The coordinator behind a refresh handle has been dropped.
    #[error("refresh coordinator is closed")]
    Closed,

    /// A background service could not be started or stopped working.
    #[error("{service} service unavailable: {details}")]
    ServiceUnavailable {
        /// Name of the service that is unavailable
        service: String,
        /// Details about why the service is unavailable
        details: String,
    },

    /// The settings file could not be read or is invalid.
    #[error("invalid settings: {details}")]
    Settings {
        /// What was wrong with the settings
        details: String,
    },
}

/// A single key that failed while applying a patch.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyFailure {
    /// Top-level key the failed write or remove targeted
    pub key: String,
    /// Error reported for that key
    pub details: String,
}

impl fmt::Display for KeyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({})", self.key, self.details)
    }
}

fn join_failures(failures: &[KeyFailure]) -> String {
    failures
        .iter()
        .map(KeyFailure::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A specialized `Result` type for cache operations.
pub type Result<T> = result::Result<T, CacheError>;

impl CacheError {
    /// Creates an `InvalidArgument` error.
    pub fn invalid_argument(argument: impl Into<String>, reason: impl fmt::Display) -> Self {
        CacheError::InvalidArgument {
            argument: argument.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates an `AlreadySubscribed` error for the named extension.
    pub fn already_subscribed(extension: impl Into<String>) -> Self {
        CacheError::AlreadySubscribed {
            extension: extension.into(),
        }
    }
}
