//! Formatting utilities for CLI output.

use serde_json::Value;

use crate::events::CacheEvent;

/// ANSI color codes for terminal output
pub struct Colors;

impl Colors {
    /// Reset all formatting
    pub const RESET: &'static str = "\x1b[0m";
    /// Bold text
    pub const BOLD: &'static str = "\x1b[1m";
    /// Dim text
    pub const DIM: &'static str = "\x1b[2m";
    /// Red color
    pub const RED: &'static str = "\x1b[31m";
    /// Green color
    pub const GREEN: &'static str = "\x1b[32m";
    /// Yellow color
    pub const YELLOW: &'static str = "\x1b[33m";
    /// Cyan color
    pub const CYAN: &'static str = "\x1b[36m";
}

/// Formats key names with styling
pub fn format_key(text: &str) -> String {
    format!("{}{}{}{}", Colors::BOLD, Colors::CYAN, text, Colors::RESET)
}

/// Formats event names with styling
pub fn format_event_name(text: &str) -> String {
    format!("{}{}{}{}", Colors::BOLD, Colors::YELLOW, text, Colors::RESET)
}

/// Formats success messages with styling
pub fn format_success(text: &str) -> String {
    format!("{}{}{}", Colors::GREEN, text, Colors::RESET)
}

/// Formats descriptions with muted styling
pub fn format_description(text: &str) -> String {
    format!("{}{}{}", Colors::DIM, text, Colors::RESET)
}

/// Formats error messages with red styling
pub fn format_error(text: &str) -> String {
    format!("{}{}{}{}", Colors::BOLD, Colors::RED, text, Colors::RESET)
}

/// Formats a value as compact JSON on one line.
///
/// # Examples
///
/// ```
/// use confsync::cli::formatting::format_value;
///
/// assert_eq!(format_value(&serde_json::json!("hello")), "\"hello\"");
/// assert_eq!(format_value(&serde_json::json!({"a": [1, 2]})), "{\"a\":[1,2]}");
/// ```
pub fn format_value(value: &Value) -> String {
    value.to_string()
}

/// Formats a value for `get`: objects and arrays are pretty-printed.
pub fn format_value_pretty(value: &Value) -> String {
    match value {
        Value::Object(_) | Value::Array(_) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
        _ => value.to_string(),
    }
}

/// One line describing an event.
pub fn format_event(event: &CacheEvent) -> String {
    let name = format_event_name(event.name());

    match event {
        CacheEvent::Set { name: key, value } => {
            format!("{name} {} = {}", format_key(key), format_value(value))
        }
        CacheEvent::Delete { name: key } => format!("{name} {}", format_key(key)),
        CacheEvent::Changed { snapshot, patch } => format!(
            "{name} v{} {}",
            snapshot.version(),
            serde_json::to_string(patch).unwrap_or_default()
        ),
        CacheEvent::Refresh { snapshot } => format!(
            "{name} v{} {}",
            snapshot.version(),
            format_description(&format!("{} keys", snapshot.len()))
        ),
    }
}
