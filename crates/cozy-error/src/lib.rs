// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable error codes for Cozy Sync Core.
//!
//! Every Cozy error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, an optional cause chain, and
//! arbitrary key-value context. Use the builder returned by
//! [`CozyError::new`] to construct errors fluently.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad disposition family that an [`ErrorCode`] belongs to.
///
/// This is the severity taxonomy the Sync Executor dispatches on: it
/// decides whether an error is retried, parked, or halts the sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network, locked file, throttling. Retried with backoff.
    Transient,
    /// Path violates target-side naming rules. Parked; surfaced to user.
    Incompatible,
    /// Both sides diverged. Auto-resolved by conflict rename; not surfaced
    /// to the user as an error.
    Conflict,
    /// Remote credentials no longer valid. Sync halts.
    Revoked,
    /// Remote rejects write for space. Sync halts.
    Quota,
    /// Metadata store integrity failure. Sync halts; user must re-link.
    Corrupt,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Incompatible => "incompatible",
            Self::Conflict => "conflict",
            Self::Revoked => "revoked",
            Self::Quota => "quota",
            Self::Corrupt => "corrupt",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl ErrorCategory {
    /// Whether the Sync Executor should retry an error in this category
    /// with exponential backoff rather than parking or halting.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Whether this category should halt the whole sync loop rather than
    /// being handled per-document.
    #[must_use]
    pub fn halts_sync(&self) -> bool {
        matches!(self, Self::Revoked | Self::Quota | Self::Corrupt)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Transient --
    /// A network request to the remote failed or timed out.
    NetworkUnavailable,
    /// The local file is locked or in use by another process.
    FileLocked,
    /// The remote is throttling requests.
    Throttled,

    // -- Incompatible --
    /// The path contains characters reserved on the target platform.
    PathReservedChars,
    /// The path uses a name reserved on the target platform (e.g. `CON`).
    PathReservedName,
    /// A path segment or the whole path exceeds the target platform's
    /// byte limit.
    PathTooLong,
    /// The path ends in a character forbidden on the target platform.
    PathTrailingChar,

    // -- Conflict --
    /// Local and remote content diverged for the same document.
    ContentConflict,
    /// Two distinct paths folded to the same canonical id.
    IdentityConflict,

    // -- Revoked --
    /// The stored OAuth credentials were rejected by the remote.
    CredentialsRevoked,

    // -- Quota --
    /// The remote rejected a write because the account is out of space.
    QuotaExceeded,

    // -- Corrupt --
    /// The metadata store's write-ahead log failed an integrity check.
    MetadataCorrupt,
    /// A document violated one of the catalog's structural invariants.
    InvariantViolation,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NetworkUnavailable | Self::FileLocked | Self::Throttled => {
                ErrorCategory::Transient
            }

            Self::PathReservedChars
            | Self::PathReservedName
            | Self::PathTooLong
            | Self::PathTrailingChar => ErrorCategory::Incompatible,

            Self::ContentConflict | Self::IdentityConflict => ErrorCategory::Conflict,

            Self::CredentialsRevoked => ErrorCategory::Revoked,

            Self::QuotaExceeded => ErrorCategory::Quota,

            Self::MetadataCorrupt | Self::InvariantViolation => ErrorCategory::Corrupt,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"NETWORK_UNAVAILABLE"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkUnavailable => "NETWORK_UNAVAILABLE",
            Self::FileLocked => "FILE_LOCKED",
            Self::Throttled => "THROTTLED",
            Self::PathReservedChars => "PATH_RESERVED_CHARS",
            Self::PathReservedName => "PATH_RESERVED_NAME",
            Self::PathTooLong => "PATH_TOO_LONG",
            Self::PathTrailingChar => "PATH_TRAILING_CHAR",
            Self::ContentConflict => "CONTENT_CONFLICT",
            Self::IdentityConflict => "IDENTITY_CONFLICT",
            Self::CredentialsRevoked => "CREDENTIALS_REVOKED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::MetadataCorrupt => "METADATA_CORRUPT",
            Self::InvariantViolation => "INVARIANT_VIOLATION",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CozyError
// ---------------------------------------------------------------------------

/// Unified Cozy Sync Core error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Examples
///
/// ```
/// use cozy_error::{CozyError, ErrorCode};
///
/// let err = CozyError::new(ErrorCode::NetworkUnavailable, "connect timed out")
///     .with_context("host", "files.example.com")
///     .with_context("timeout_ms", 30_000);
/// assert!(err.category().is_retryable());
/// ```
pub struct CozyError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl CozyError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if
    /// serialisation fails, the entry is silently skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for CozyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("CozyError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for CozyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for CozyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`CozyError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CozyErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&CozyError> for CozyErrorDto {
    fn from(err: &CozyError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<CozyErrorDto> for CozyError {
    fn from(dto: CozyErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::NetworkUnavailable,
        ErrorCode::FileLocked,
        ErrorCode::Throttled,
        ErrorCode::PathReservedChars,
        ErrorCode::PathReservedName,
        ErrorCode::PathTooLong,
        ErrorCode::PathTrailingChar,
        ErrorCode::ContentConflict,
        ErrorCode::IdentityConflict,
        ErrorCode::CredentialsRevoked,
        ErrorCode::QuotaExceeded,
        ErrorCode::MetadataCorrupt,
        ErrorCode::InvariantViolation,
        ErrorCode::Internal,
    ];

    #[test]
    fn basic_construction() {
        let err = CozyError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = CozyError::new(ErrorCode::QuotaExceeded, "account is full");
        assert_eq!(err.to_string(), "[QUOTA_EXCEEDED] account is full");
    }

    #[test]
    fn display_with_context() {
        let err = CozyError::new(ErrorCode::NetworkUnavailable, "timed out")
            .with_context("timeout_ms", 5000);
        let s = err.to_string();
        assert!(s.starts_with("[NETWORK_UNAVAILABLE] timed out"));
        assert!(s.contains("timeout_ms"));
    }

    #[test]
    fn retryable_only_for_transient() {
        assert!(ErrorCode::NetworkUnavailable.category().is_retryable());
        assert!(ErrorCode::FileLocked.category().is_retryable());
        assert!(!ErrorCode::ContentConflict.category().is_retryable());
        assert!(!ErrorCode::QuotaExceeded.category().is_retryable());
    }

    #[test]
    fn halting_categories() {
        assert!(ErrorCode::CredentialsRevoked.category().halts_sync());
        assert!(ErrorCode::QuotaExceeded.category().halts_sync());
        assert!(ErrorCode::MetadataCorrupt.category().halts_sync());
        assert!(!ErrorCode::NetworkUnavailable.category().halts_sync());
        assert!(!ErrorCode::ContentConflict.category().halts_sync());
    }

    #[test]
    fn path_codes_are_incompatible() {
        for code in [
            ErrorCode::PathReservedChars,
            ErrorCode::PathReservedName,
            ErrorCode::PathTooLong,
            ErrorCode::PathTrailingChar,
        ] {
            assert_eq!(code.category(), ErrorCategory::Incompatible);
        }
    }

    #[test]
    fn builder_with_source() {
        let src = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = CozyError::new(ErrorCode::FileLocked, "denied").with_source(src);
        assert!(err.source.is_some());
        assert_eq!(
            std::error::Error::source(&err).unwrap().to_string(),
            "access denied"
        );
    }

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            assert!(seen.insert(code.as_str()), "duplicate as_str: {code:?}");
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn error_code_serde_roundtrip() {
        let code = ErrorCode::PathTooLong;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, r#""PATH_TOO_LONG""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn dto_roundtrip_with_source() {
        let src = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke");
        let err = CozyError::new(ErrorCode::NetworkUnavailable, "crash").with_source(src);
        let dto: CozyErrorDto = (&err).into();
        assert_eq!(dto.source_message.as_deref(), Some("pipe broke"));
        let json = serde_json::to_string(&dto).unwrap();
        let back: CozyErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, back);
    }

    #[test]
    fn error_category_display() {
        assert_eq!(ErrorCategory::Transient.to_string(), "transient");
        assert_eq!(ErrorCategory::Corrupt.to_string(), "corrupt");
    }
}
