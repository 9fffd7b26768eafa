//! Command-line interface over a settings-built coordinator.
//!
//! Argument parsing is done with clap; [`CliService`] runs a parsed
//! [`Command`] against a coordinator and renders the output.

pub mod formatting;
mod service;


use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use service::CliService;

/// Settings file used when `--settings` is not given.
pub const DEFAULT_SETTINGS_FILE: &str = "confsync.toml";

/// Top-level arguments.
#[derive(Debug, Parser)]
#[command(name = "confsync")]
#[command(about = "Inspect and edit a refreshing configuration cache")]
#[command(version)]
pub struct Cli {
    /// Settings file describing the store and refresh policy
    #[arg(short, long, global = true)]
    pub settings: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Command to run
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Print the value of a key as JSON
    Get {
        /// Top-level key
        key: String,
    },
    /// Print every key and value
    List,
    /// Set a key; the value is parsed as JSON, or taken as a string
    Set {
        /// Top-level key
        key: String,
        /// New value
        value: String,
    },
    /// Remove a key
    Remove {
        /// Top-level key
        key: String,
    },
    /// Apply a JSON patch document, e.g. '[{"op":"add","path":"/a","value":1}]'
    Patch {
        /// Patch operations as a JSON array
        patch: String,
    },
    /// Print events for keys matching a pattern until interrupted
    Watch {
        /// Dot-separated key pattern, "*" matches everything
        #[arg(default_value = "*")]
        pattern: String,
    },
    /// Print the JSON schema of the settings file
    Schema,
}
