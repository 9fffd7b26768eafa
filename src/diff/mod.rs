//! Snapshot comparison and patch application.
//!
//! [`compare`] produces the ordered set of JSON-patch style operations that
//! turn one snapshot into another, and [`apply`] replays such a patch onto a
//! mapping in place. [`merge`] is the forgiving variant used for patches that
//! were computed against some other snapshot.

pub mod pointer;


use std::{slice, vec};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single patch operation addressed by a JSON pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    /// Insert a value at a path that did not exist before.
    Add {
        /// JSON pointer to the new value
        path: String,
        /// The inserted value
        value: Value,
    },
    /// Overwrite the value at an existing path.
    Replace {
        /// JSON pointer to the replaced value
        path: String,
        /// The new value
        value: Value,
    },
    /// Delete the value at an existing path.
    Remove {
        /// JSON pointer to the removed value
        path: String,
    },
}

impl PatchOperation {
    /// The JSON pointer this operation targets.
    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Remove { path } => path,
        }
    }

    /// The value carried by add and replace operations.
    pub fn value(&self) -> Option<&Value> {
        match self {
            PatchOperation::Add { value, .. } | PatchOperation::Replace { value, .. } => {
                Some(value)
            }
            PatchOperation::Remove { .. } => None,
        }
    }

    /// First segment of the path, which is the key a store is addressed by.
    ///
    /// # Errors
    /// * `PatchError::InvalidPath` - If the path is not a valid JSON pointer
    pub fn top_level_key(&self) -> Result<String, PatchError> {
        pointer::top_level_key(self.path())
    }
}

/// An ordered list of patch operations.
///
/// Serializes as a plain JSON array, compatible with JSON-patch documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch(Vec<PatchOperation>);

impl Patch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the patch contains no operations.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of operations in the patch.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over operations in application order.
    pub fn iter(&self) -> slice::Iter<'_, PatchOperation> {
        self.0.iter()
    }

    /// Appends an operation.
    pub fn push(&mut self, operation: PatchOperation) {
        self.0.push(operation);
    }

    /// Distinct top-level keys touched by the patch, in first-seen order.
    ///
    /// # Errors
    /// * `PatchError::InvalidPath` - If any operation has a malformed path
    pub fn top_level_keys(&self) -> Result<Vec<String>, PatchError> {
        let mut keys: Vec<String> = Vec::new();

        for operation in &self.0 {
            let key = operation.top_level_key()?;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        Ok(keys)
    }

    /// Returns true when any operation targets the given top-level key.
    pub fn touches(&self, key: &str) -> bool {
        self.0
            .iter()
            .any(|operation| operation.top_level_key().is_ok_and(|k| k == key))
    }
}

impl From<Vec<PatchOperation>> for Patch {
    fn from(operations: Vec<PatchOperation>) -> Self {
        Self(operations)
    }
}

impl IntoIterator for Patch {
    type Item = PatchOperation;
    type IntoIter = vec::IntoIter<PatchOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Patch {
    type Item = &'a PatchOperation;
    type IntoIter = slice::Iter<'a, PatchOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Errors raised when a patch cannot be applied.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatchError {
    /// The path is not a usable JSON pointer.
    #[error("invalid patch path '{path}': {reason}")]
    InvalidPath {
        /// The offending pointer
        path: String,
        /// Why it was rejected
        reason: String,
    },

    /// An intermediate segment does not exist or is not an object.
    #[error("cannot apply '{path}': parent '{parent}' is missing or not an object")]
    MissingParent {
        /// The pointer being applied
        path: String,
        /// The first parent that could not be traversed
        parent: String,
    },

    /// A replace or remove targeted a value that does not exist.
    #[error("cannot apply '{path}': no value at target")]
    MissingTarget {
        /// The pointer being applied
        path: String,
    },
}

/// Compares two snapshots and returns the operations turning `old` into `new`.
///
/// Keys only in `new` become adds, keys only in `old` become removes, and keys
/// present in both with different values become replaces. When both values are
/// objects the comparison recurses and emits operations on nested paths.
///
/// Operations for keys of `old` come first, in map order, followed by adds for
/// keys that only exist in `new`.
pub fn compare(old: &Map<String, Value>, new: &Map<String, Value>) -> Patch {
    let mut patch = Patch::new();
    diff_maps("", old, new, &mut patch);
    patch
}

fn diff_maps(prefix: &str, old: &Map<String, Value>, new: &Map<String, Value>, patch: &mut Patch) {
    for (key, old_value) in old {
        let path = pointer::join(prefix, key);

        match new.get(key) {
            Some(new_value) => diff_values(path, old_value, new_value, patch),
            None => patch.push(PatchOperation::Remove { path }),
        }
    }

    for (key, new_value) in new {
        if !old.contains_key(key) {
            patch.push(PatchOperation::Add {
                path: pointer::join(prefix, key),
                value: new_value.clone(),
            });
        }
    }
}

fn diff_values(path: String, old: &Value, new: &Value, patch: &mut Patch) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            diff_maps(&path, old_map, new_map, patch);
        }
        _ => {
            if old != new {
                patch.push(PatchOperation::Replace {
                    path,
                    value: new.clone(),
                });
            }
        }
    }
}

/// Applies a patch to a mapping in place, operation by operation.
///
/// An empty patch leaves the target untouched. On error the operations that
/// preceded the failing one remain applied.
///
/// # Errors
/// * `PatchError::InvalidPath` - If an operation's path is malformed
/// * `PatchError::MissingParent` - If a nested path's parent is absent or not an object
/// * `PatchError::MissingTarget` - If a replace or remove targets an absent value
pub fn apply(target: &mut Map<String, Value>, patch: &Patch) -> Result<(), PatchError> {
    for operation in patch {
        apply_operation(target, operation)?;
    }

    Ok(())
}

fn apply_operation(
    target: &mut Map<String, Value>,
    operation: &PatchOperation,
) -> Result<(), PatchError> {
    let path = operation.path();
    let segments = pointer::split(path)?;

    let Some((last, parents)) = segments.split_last() else {
        return Err(PatchError::InvalidPath {
            path: path.to_string(),
            reason: "pointer has no segments".to_string(),
        });
    };

    let container = navigate_to_parent_mut(target, parents, path)?;

    match operation {
        PatchOperation::Add { value, .. } => {
            container.insert(last.clone(), value.clone());
        }
        PatchOperation::Replace { value, .. } => {
            let slot = container
                .get_mut(last)
                .ok_or_else(|| PatchError::MissingTarget {
                    path: path.to_string(),
                })?;
            *slot = value.clone();
        }
        PatchOperation::Remove { .. } => {
            container
                .remove(last)
                .ok_or_else(|| PatchError::MissingTarget {
                    path: path.to_string(),
                })?;
        }
    }

    Ok(())
}

/// Applies a patch leniently, for patches produced against another snapshot.
///
/// Add and replace both set the target, creating any missing intermediate
/// objects (a non-object parent is overwritten). A remove whose target or
/// parent is absent does nothing.
///
/// # Errors
/// * `PatchError::InvalidPath` - If an operation's path is malformed
pub fn merge(target: &mut Map<String, Value>, patch: &Patch) -> Result<(), PatchError> {
    for operation in patch {
        let path = operation.path();
        let segments = pointer::split(path)?;

        let Some((last, parents)) = segments.split_last() else {
            return Err(PatchError::InvalidPath {
                path: path.to_string(),
                reason: "pointer has no segments".to_string(),
            });
        };

        match operation.value() {
            Some(value) => {
                ensure_parent_mut(target, parents).insert(last.clone(), value.clone());
            }
            None => {
                if let Ok(container) = navigate_to_parent_mut(target, parents, path) {
                    container.remove(last);
                }
            }
        }
    }

    Ok(())
}

/// Walks down to the object that holds the final path segment, creating
/// objects along the way.
fn ensure_parent_mut<'a>(
    root: &'a mut Map<String, Value>,
    parents: &[String],
) -> &'a mut Map<String, Value> {
    let mut current = root;

    for segment in parents {
        let slot = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(child) = slot else {
            unreachable!("slot was just made an object");
        };
        current = child;
    }

    current
}

/// Walks down to the object that holds the final path segment.
fn navigate_to_parent_mut<'a>(
    root: &'a mut Map<String, Value>,
    parents: &[String],
    path: &str,
) -> Result<&'a mut Map<String, Value>, PatchError> {
    let mut current = root;

    for (i, segment) in parents.iter().enumerate() {
        current = match current.get_mut(segment) {
            Some(Value::Object(child)) => child,
            _ => {
                return Err(PatchError::MissingParent {
                    path: path.to_string(),
                    parent: pointer::from_segments(&parents[..=i]),
                });
            }
        };
    }

    Ok(current)
}
