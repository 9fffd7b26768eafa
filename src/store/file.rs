use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{fs, sync::Mutex};
use tracing::debug;

use super::{Store, StoreError, Values};

/// A store backed by a single TOML file.
///
/// Each top-level key of the document is one cache key; tables become JSON
/// objects. A missing file reads as an empty mapping. Writes rewrite the whole
/// document through a temporary file and an atomic rename.
#[derive(Debug)]
pub struct TomlFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TomlFileStore {
    /// Creates a store for the given file. The file does not need to exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// The file this store reads and writes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_table(&self) -> Result<toml::Table, StoreError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(toml::Table::new()),
            Err(e) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    details: e.to_string(),
                });
            }
        };

        toml::from_str(&content).map_err(|e| StoreError::Parse {
            location: self.path.display().to_string(),
            details: e.to_string(),
        })
    }

    async fn persist(&self, table: &toml::Table) -> Result<(), StoreError> {
        let toml_str = toml::to_string_pretty(table).map_err(|e| StoreError::Serialization {
            key: self.path.display().to_string(),
            details: e.to_string(),
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Io {
                    path: parent.to_path_buf(),
                    details: format!("Failed to create directory: {e}"),
                })?;
        }

        let temp_path = self.path.with_extension("tmp");

        fs::write(&temp_path, toml_str)
            .await
            .map_err(|e| StoreError::Io {
                path: temp_path.clone(),
                details: e.to_string(),
            })?;

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| StoreError::Io {
                path: self.path.clone(),
                details: e.to_string(),
            })?;

        debug!(path = %self.path.display(), "Persisted settings file");
        Ok(())
    }
}

#[async_trait]
impl Store for TomlFileStore {
    async fn fetch_all(&self) -> Result<Values, StoreError> {
        let table = self.read_table().await?;

        match serde_json::to_value(table) {
            Ok(Value::Object(values)) => Ok(values),
            Ok(other) => Err(StoreError::Parse {
                location: self.path.display().to_string(),
                details: format!("expected a table, found {other}"),
            }),
            Err(e) => Err(StoreError::Parse {
                location: self.path.display().to_string(),
                details: e.to_string(),
            }),
        }
    }

    async fn write(&self, name: &str, value: &Value) -> Result<(), StoreError> {
        let toml_value = toml::Value::try_from(value).map_err(|e| StoreError::Serialization {
            key: name.to_string(),
            details: e.to_string(),
        })?;

        let _guard = self.write_lock.lock().await;
        let mut table = self.read_table().await?;
        table.insert(name.to_string(), toml_value);

        self.persist(&table).await
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut table = self.read_table().await?;

        if table.remove(name).is_none() {
            return Ok(());
        }

        self.persist(&table).await
    }
}
