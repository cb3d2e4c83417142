// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request/response envelope types for the control API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Body returned by `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Whether the core's background tasks are currently running.
    pub running: bool,
    /// The sync root the core is watching.
    pub sync_root: String,
    /// Number of documents currently tracked in the catalog.
    pub catalog_size: usize,
}

/// Body returned by `GET /disk-usage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskUsageResponse {
    /// Bytes currently used on the remote.
    pub used: u64,
    /// Total bytes available, if the remote enforces a quota.
    pub quota: Option<u64>,
}

impl From<cozy_protocol::DiskUsageInfo> for DiskUsageResponse {
    fn from(info: cozy_protocol::DiskUsageInfo) -> Self {
        Self {
            used: info.used,
            quota: info.quota,
        }
    }
}

/// A structured, stable-coded API error.
///
/// `code` is a short machine-readable slug (`"not_found"`,
/// `"invalid_request"`, `"conflict"`, `"internal_error"`); `message` is a
/// human-readable summary; `details` carries optional structured context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable summary.
    pub message: String,
    /// Optional structured context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Build a bare error with no details.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured `details` to this error.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The core has not been started yet, or is already running.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    /// The remote or the local filesystem rejected the request.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }

    fn status(&self) -> StatusCode {
        match self.code.as_str() {
            "conflict" => StatusCode::CONFLICT,
            "invalid_request" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(self)).into_response()
    }
}
