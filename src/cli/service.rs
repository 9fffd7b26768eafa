use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{
    Command,
    formatting::{format_event, format_key, format_success, format_value, format_value_pretty},
};
use crate::{CacheError, RefreshCoordinator, Result, diff::Patch, settings};

/// Runs parsed commands against a coordinator.
pub struct CliService {
    coordinator: RefreshCoordinator,
}

impl CliService {
    /// Creates a service over `coordinator`.
    pub fn new(coordinator: RefreshCoordinator) -> Self {
        Self { coordinator }
    }

    /// Executes a command and returns its output.
    ///
    /// `watch` prints events as they arrive and returns an empty string once
    /// interrupted.
    ///
    /// # Errors
    /// * `CacheError::InvalidArgument` - If an argument does not parse or `get` names an absent key
    /// * Any error reported by the coordinator for the operation
    #[instrument(skip(self))]
    pub async fn execute(&self, command: Command) -> Result<String> {
        match command {
            Command::Get { key } => self.get(&key).await,
            Command::List => self.list().await,
            Command::Set { key, value } => {
                let value = parse_value(&value);
                self.coordinator.write(&key, value.clone()).await?;
                Ok(format_success(&format!("set {key} = {}", format_value(&value))))
            }
            Command::Remove { key } => {
                self.coordinator.remove(&key).await?;
                Ok(format_success(&format!("removed {key}")))
            }
            Command::Patch { patch } => {
                let patch: Patch = serde_json::from_str(&patch)
                    .map_err(|e| CacheError::invalid_argument("patch", e))?;
                self.coordinator.apply_patch(&patch).await?;
                Ok(format_success(&format!("applied {} operation(s)", patch.len())))
            }
            Command::Watch { pattern } => {
                self.watch(&pattern).await?;
                Ok(String::new())
            }
            Command::Schema => settings::schema(),
        }
    }

    async fn get(&self, key: &str) -> Result<String> {
        match self.coordinator.read(key).await? {
            Some(value) => Ok(format_value_pretty(&value)),
            None => Err(CacheError::invalid_argument(
                "key",
                format!("'{key}' is not set"),
            )),
        }
    }

    async fn list(&self) -> Result<String> {
        let snapshot = self.coordinator.read_all().await?;

        let lines: Vec<String> = snapshot
            .values()
            .iter()
            .map(|(key, value)| format!("{} = {}", format_key(key), format_value(value)))
            .collect();

        Ok(lines.join("\n"))
    }

    /// Prints events for keys matching `pattern` until Ctrl-C.
    ///
    /// # Errors
    /// * `CacheError::Store` - If the initial refresh fails
    pub async fn watch(&self, pattern: &str) -> Result<()> {
        self.coordinator.read_all().await?;

        let mut events = Box::pin(self.coordinator.watch_keys(pattern));
        debug!(pattern, "Watching for changes");

        loop {
            tokio::select! {
                Some(event) = events.next() => println!("{}", format_event(&event)),
                _ = tokio::signal::ctrl_c() => break,
                else => break,
            }
        }

        Ok(())
    }
}

/// Parses a command-line value as JSON, falling back to a plain string.
pub(crate) fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
