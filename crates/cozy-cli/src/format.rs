// SPDX-License-Identifier: MIT OR Apache-2.0
//! Output formatting for cozy-cli.

use cozy_daemon::api::{DiskUsageResponse, StatusResponse};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported output formats for CLI display.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Compact JSON (single line).
    Json,
    /// Pretty-printed JSON.
    JsonPretty,
    /// Human-readable multi-line text.
    Text,
    /// Key-value aligned table.
    Table,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Json => "json",
            Self::JsonPretty => "json-pretty",
            Self::Text => "text",
            Self::Table => "table",
        };
        f.write_str(s)
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "json-pretty" | "json_pretty" | "jsonpretty" => Ok(Self::JsonPretty),
            "text" => Ok(Self::Text),
            "table" => Ok(Self::Table),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// Renders control-API responses for terminal display.
#[derive(Debug, Clone)]
pub struct Formatter {
    format: OutputFormat,
}

impl Formatter {
    /// Create a new formatter with the given output format.
    #[must_use]
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Format a [`StatusResponse`] according to the configured output format.
    #[must_use]
    pub fn format_status(&self, status: &StatusResponse) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(status).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(status).unwrap_or_default(),
            OutputFormat::Text => format!(
                "running: {}\nsync root: {}\ndocuments tracked: {}",
                status.running, status.sync_root, status.catalog_size
            ),
            OutputFormat::Table => format!(
                "{:<10} {}\n{:<10} {}\n{:<10} {}",
                "running", status.running, "root", status.sync_root, "docs", status.catalog_size
            ),
        }
    }

    /// Format a [`DiskUsageResponse`] according to the configured output
    /// format.
    #[must_use]
    pub fn format_disk_usage(&self, usage: &DiskUsageResponse) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(usage).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(usage).unwrap_or_default(),
            OutputFormat::Text => match usage.quota {
                Some(quota) => format!("used: {} bytes\nquota: {} bytes", usage.used, quota),
                None => format!("used: {} bytes\nquota: unbounded", usage.used),
            },
            OutputFormat::Table => match usage.quota {
                Some(quota) => format!("{:<8} {}\n{:<8} {}", "used", usage.used, "quota", quota),
                None => format!("{:<8} {}\n{:<8} {}", "used", usage.used, "quota", "unbounded"),
            },
        }
    }

    /// Format one line of the `GET /events` NDJSON stream.
    #[must_use]
    pub fn format_event(&self, event: &serde_json::Value) -> String {
        match self.format {
            OutputFormat::Json => event.to_string(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(event).unwrap_or_default(),
            OutputFormat::Text | OutputFormat::Table => {
                let kind = event.get("kind").and_then(|k| k.as_str()).unwrap_or("unknown");
                format!("[{kind}] {event}")
            }
        }
    }

    /// Format an error message according to the configured output format.
    #[must_use]
    pub fn format_error(&self, err: &str) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => {
                serde_json::json!({"error": err}).to_string()
            }
            OutputFormat::Text => format!("error: {err}"),
            OutputFormat::Table => format!("{:<8} {}", "error", err),
        }
    }
}
