// SPDX-License-Identifier: MIT OR Apache-2.0
//! Layered configuration for the Cozy Sync Core daemon.
//!
//! A [`SyncConfig`] is loaded from a TOML file on disk, then overridden
//! field-by-field by environment variables, then validated. Validation can
//! fail hard (misconfiguration that would make the daemon unsafe to run) or
//! produce advisory [`ConfigWarning`]s that are logged but don't block
//! startup.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on `retry.max_attempts`; above this a flaky remote would
/// retry for longer than an interactive session is likely to last.
const MAX_RETRY_ATTEMPTS: u32 = 100;
/// Above this base delay a first retry already feels like a hang.
const LARGE_BASE_DELAY_THRESHOLD_SECS: u64 = 30;
/// Aggregation window longer than this risks surprising users with how
/// long a single file change takes to reach the catalog.
const LARGE_WINDOW_THRESHOLD_SECS: u64 = 30;

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Errors that prevent a usable configuration from being produced.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file does not exist at the given path.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// The path that was probed.
        path: PathBuf,
    },
    /// The file exists but isn't valid TOML or doesn't match the schema.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse failure.
        reason: String,
    },
    /// The parsed configuration failed one or more hard validation checks.
    #[error("invalid config: {}", .reasons.join("; "))]
    ValidationError {
        /// One message per failed check.
        reasons: Vec<String>,
    },
}

/// A non-fatal concern surfaced during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A field is set to a value technically valid but unlikely to be
    /// what the user intended.
    UnusualValue {
        /// The field in question.
        field: String,
        /// Why it's unusual.
        hint: String,
    },
    /// An optional field was left unset and a default is being used.
    MissingOptionalField {
        /// The field in question.
        field: String,
        /// What the default behaves like.
        hint: String,
    },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::UnusualValue { field, hint } => {
                write!(f, "field '{field}' has an unusual value: {hint}")
            }
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "field '{field}' not set: {hint}")
            }
        }
    }
}

/// An OAuth bearer token. `Debug` and `Serialize` both redact the value so
/// it never ends up in a log line or an error message by accident.
#[derive(Clone, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct Secret(String);

impl Secret {
    /// The token value, for handing to the HTTP client.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl Serialize for Secret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("<redacted>")
    }
}

/// Exponential backoff bounds for remote retries.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Number of attempts before giving up and surfacing a `SyncError`.
    pub max_attempts: u32,
    /// Delay before the first retry, in seconds.
    pub base_delay_secs: u64,
    /// Upper bound any single delay is clamped to, in seconds.
    pub max_delay_secs: u64,
    /// Fraction of the computed delay randomized away by jitter, 0.0-1.0.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 16,
            base_delay_secs: 1,
            max_delay_secs: 300,
            jitter_factor: 1.0,
        }
    }
}

impl RetryConfig {
    /// `base_delay_secs` as a [`Duration`].
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    /// `max_delay_secs` as a [`Duration`].
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

/// Bounds on how long local filesystem events are buffered before being
/// reconciled into move/rename events.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct WindowConfig {
    /// Idle time after the last observation before a window is flushed.
    pub base_secs: u64,
    /// Hard cap on how long a window can be extended, regardless of
    /// ongoing activity.
    pub max_secs: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            base_secs: 1,
            max_secs: 3,
        }
    }
}

impl WindowConfig {
    /// `base_secs` as a [`Duration`].
    #[must_use]
    pub fn base(&self) -> Duration {
        Duration::from_secs(self.base_secs)
    }

    /// `max_secs` as a [`Duration`].
    #[must_use]
    pub fn max(&self) -> Duration {
        Duration::from_secs(self.max_secs)
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Local directory kept in sync.
    pub sync_root: PathBuf,
    /// Base URL of the remote sync API.
    pub remote_url: String,
    /// OAuth bearer token used to authenticate with the remote. `None`
    /// until the device has completed onboarding.
    pub token: Option<Secret>,
    /// Name this device presents to the remote, e.g. in conflict file
    /// names and the device list.
    pub device_name: String,
    /// Retry bounds applied to remote operations.
    pub retry: RetryConfig,
    /// Local event aggregation window.
    pub window: WindowConfig,
    /// Force a case-sensitivity mode instead of inferring it from the
    /// host platform.
    pub case_sensitive_override: Option<bool>,
    /// `tracing` filter directive, e.g. `"info"` or `"cozy_sync=debug"`.
    pub log_level: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_root: PathBuf::from("."),
            remote_url: String::new(),
            token: None,
            device_name: "cozy-device".to_string(),
            retry: RetryConfig::default(),
            window: WindowConfig::default(),
            case_sensitive_override: None,
            log_level: "info".to_string(),
        }
    }
}

/// Load configuration from `path`, falling back to defaults if `path` is
/// `None`, then apply environment overrides.
///
/// Does not validate; call [`validate_config`] on the result.
pub fn load_config(path: Option<&Path>) -> Result<SyncConfig, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let content =
                std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                })?;
            parse_toml(&content)?
        }
        None => SyncConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML document into a [`SyncConfig`].
pub fn parse_toml(content: &str) -> Result<SyncConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Apply `COZY_*` environment variable overrides in place.
pub fn apply_env_overrides(config: &mut SyncConfig) {
    if let Ok(root) = std::env::var("COZY_SYNC_ROOT") {
        config.sync_root = PathBuf::from(root);
    }
    if let Ok(url) = std::env::var("COZY_REMOTE_URL") {
        config.remote_url = url;
    }
    if let Ok(token) = std::env::var("COZY_TOKEN") {
        config.token = Some(Secret(token));
    }
    if let Ok(name) = std::env::var("COZY_DEVICE_NAME") {
        config.device_name = name;
    }
    if let Ok(level) = std::env::var("COZY_LOG_LEVEL") {
        config.log_level = level;
    }
}

/// Run hard validation checks, returning advisory warnings on success.
pub fn validate_config(config: &SyncConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut reasons = Vec::new();

    if !VALID_LOG_LEVELS.contains(&config.log_level.as_str()) {
        reasons.push(format!(
            "log_level '{}' must be one of {VALID_LOG_LEVELS:?}",
            config.log_level
        ));
    }
    if config.remote_url.is_empty() {
        reasons.push("remote_url must not be empty".to_string());
    }
    if config.device_name.trim().is_empty() {
        reasons.push("device_name must not be empty".to_string());
    }
    if config.retry.max_attempts == 0 {
        reasons.push("retry.max_attempts must be at least 1".to_string());
    }
    if config.retry.max_attempts > MAX_RETRY_ATTEMPTS {
        reasons.push(format!(
            "retry.max_attempts {} exceeds the maximum of {MAX_RETRY_ATTEMPTS}",
            config.retry.max_attempts
        ));
    }
    if config.retry.base_delay_secs > config.retry.max_delay_secs {
        reasons.push("retry.base_delay_secs must not exceed retry.max_delay_secs".to_string());
    }
    if !(0.0..=1.0).contains(&config.retry.jitter_factor) {
        reasons.push("retry.jitter_factor must be between 0.0 and 1.0".to_string());
    }
    if config.window.base_secs > config.window.max_secs {
        reasons.push("window.base_secs must not exceed window.max_secs".to_string());
    }

    if !reasons.is_empty() {
        return Err(ConfigError::ValidationError { reasons });
    }

    let mut warnings = Vec::new();
    if config.retry.base_delay_secs > LARGE_BASE_DELAY_THRESHOLD_SECS {
        warnings.push(ConfigWarning::UnusualValue {
            field: "retry.base_delay_secs".to_string(),
            hint: format!(
                "{}s is a long first retry delay",
                config.retry.base_delay_secs
            ),
        });
    }
    if config.window.max_secs > LARGE_WINDOW_THRESHOLD_SECS {
        warnings.push(ConfigWarning::UnusualValue {
            field: "window.max_secs".to_string(),
            hint: format!("{}s delays move detection noticeably", config.window.max_secs),
        });
    }
    if config.token.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "token".to_string(),
            hint: "device has not completed onboarding yet".to_string(),
        });
    }
    if config.case_sensitive_override.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "case_sensitive_override".to_string(),
            hint: "case sensitivity will be inferred from the host platform".to_string(),
        });
    }

    Ok(warnings)
}

/// Merge `overlay` onto `base`, with `overlay` taking precedence wherever
/// it differs from the default.
#[must_use]
pub fn merge_configs(base: &SyncConfig, overlay: &SyncConfig) -> SyncConfig {
    let default = SyncConfig::default();
    SyncConfig {
        sync_root: if overlay.sync_root != default.sync_root {
            overlay.sync_root.clone()
        } else {
            base.sync_root.clone()
        },
        remote_url: if !overlay.remote_url.is_empty() {
            overlay.remote_url.clone()
        } else {
            base.remote_url.clone()
        },
        token: overlay.token.clone().or_else(|| base.token.clone()),
        device_name: if overlay.device_name != default.device_name {
            overlay.device_name.clone()
        } else {
            base.device_name.clone()
        },
        retry: if overlay.retry != default.retry {
            overlay.retry.clone()
        } else {
            base.retry.clone()
        },
        window: if overlay.window != default.window {
            overlay.window.clone()
        } else {
            base.window.clone()
        },
        case_sensitive_override: overlay
            .case_sensitive_override
            .or(base.case_sensitive_override),
        log_level: if overlay.log_level != default.log_level {
            overlay.log_level.clone()
        } else {
            base.log_level.clone()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid_shaped_but_warns_on_empty_remote() {
        let config = SyncConfig::default();
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            remote_url = "https://sync.example.com"
            device_name = "laptop"
        "#;
        let config = parse_toml(toml).unwrap();
        assert_eq!(config.remote_url, "https://sync.example.com");
        assert_eq!(config.retry.max_attempts, 16);
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = parse_toml("not valid = = toml").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validate_rejects_unknown_log_level() {
        let mut config = SyncConfig {
            remote_url: "https://sync.example.com".to_string(),
            ..SyncConfig::default()
        };
        config.log_level = "verbose".to_string();
        let err = validate_config(&config).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("log_level")));
            }
            _ => panic!("expected ValidationError"),
        }
    }

    #[test]
    fn validate_rejects_inverted_retry_bounds() {
        let mut config = SyncConfig {
            remote_url: "https://sync.example.com".to_string(),
            ..SyncConfig::default()
        };
        config.retry.base_delay_secs = 100;
        config.retry.max_delay_secs = 10;
        let err = validate_config(&config).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("base_delay_secs")));
            }
            _ => panic!("expected ValidationError"),
        }
    }

    #[test]
    fn validate_warns_on_missing_token_and_case_override() {
        let config = SyncConfig {
            remote_url: "https://sync.example.com".to_string(),
            ..SyncConfig::default()
        };
        let warnings = validate_config(&config).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::MissingOptionalField { field, .. } if field == "token")));
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::MissingOptionalField { field, .. } if field == "case_sensitive_override")));
    }

    #[test]
    fn validate_warns_on_large_window() {
        let mut config = SyncConfig {
            remote_url: "https://sync.example.com".to_string(),
            case_sensitive_override: Some(true),
            token: Some(Secret("t".to_string())),
            ..SyncConfig::default()
        };
        config.window.max_secs = 60;
        let warnings = validate_config(&config).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::UnusualValue { field, .. } if field == "window.max_secs")));
    }

    #[test]
    fn merge_prefers_overlay_values_over_base() {
        let base = SyncConfig {
            remote_url: "https://base.example.com".to_string(),
            device_name: "base-device".to_string(),
            ..SyncConfig::default()
        };
        let overlay = SyncConfig {
            device_name: "overlay-device".to_string(),
            ..SyncConfig::default()
        };
        let merged = merge_configs(&base, &overlay);
        assert_eq!(merged.remote_url, "https://base.example.com");
        assert_eq!(merged.device_name, "overlay-device");
    }

    #[test]
    fn secret_debug_and_serialize_redact_the_value() {
        let secret = Secret("super-secret-token".to_string());
        assert_eq!(format!("{secret:?}"), "Secret(<redacted>)");
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, "\"<redacted>\"");
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config(Some(Path::new("/nonexistent/cozy.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_config_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"remote_url = "https://sync.example.com""#).unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.remote_url, "https://sync.example.com");
    }

    #[test]
    fn env_overrides_apply_on_top_of_file_config() {
        std::env::set_var("COZY_DEVICE_NAME", "env-device");
        let mut config = SyncConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.device_name, "env-device");
        std::env::remove_var("COZY_DEVICE_NAME");
    }
}
