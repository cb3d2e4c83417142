// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed HTTP client for the remote sync API.
//!
//! The wire format mirrors explicit serde envelopes rather than
//! stringly-typed JSON: every request and response is a concrete struct or
//! tagged enum, so a malformed payload fails at the deserialization
//! boundary instead of surfacing as a missing-field panic three calls
//! later.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cozy_path::DocType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Long-poll timeout applied to `GET /changes` when no explicit timeout is
/// requested.
pub const DEFAULT_LONGPOLL_TIMEOUT: Duration = Duration::from_secs(30);

/// A directory entry or file as reported by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Remote-assigned identifier, stable across renames.
    pub id: String,
    /// Path relative to the synced root, as the remote currently has it.
    pub path: String,
    /// Remote revision counter for this entry.
    pub rev: u64,
    /// File or folder.
    pub doc_type: DocType,
    /// Base64 MD5 content digest; present for files, absent for folders.
    pub md5sum: Option<String>,
    /// Size in bytes; present for files.
    pub size: Option<u64>,
    /// Last-modified timestamp as recorded by the remote.
    pub updated_at: DateTime<Utc>,
}

/// The kind of change a [`RemoteChange`] describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteChangeKind {
    /// A new entry was created.
    Add,
    /// An existing file's content changed.
    Update,
    /// An entry was renamed or relocated.
    Move {
        /// The entry's path before the move.
        old_path: String,
    },
    /// An entry was moved to the remote trash.
    Trash,
    /// A previously trashed entry was restored.
    Restore,
    /// An entry was permanently deleted (purged from the trash).
    Delete,
}

/// A single row of the remote change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Monotonic position of this change in the feed.
    pub seq: u64,
    /// The affected entry's identifier.
    pub remote_id: String,
    /// What happened.
    pub kind: RemoteChangeKind,
    /// The entry as it now stands; `None` for [`RemoteChangeKind::Delete`].
    pub entry: Option<RemoteEntry>,
}

/// One page of the `changes` long-poll feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesPage {
    /// Changes since the requested cursor, in feed order.
    pub changes: Vec<RemoteChange>,
    /// Cursor to pass as `since` on the next call.
    pub last_seq: u64,
}

/// Remote storage quota, as reported by `GET /usage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsageInfo {
    /// Bytes currently used on the remote.
    pub used: u64,
    /// Total bytes available, if the remote enforces a quota.
    pub quota: Option<u64>,
}

/// Errors raised by a [`RemoteClient`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The underlying HTTP transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response body could not be parsed as the expected envelope.
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The remote API returned a non-success status with a structured
    /// error body.
    #[error("remote API error ({status}): {message}")]
    Api {
        /// HTTP status code returned.
        status: u16,
        /// Human-readable message from the error body.
        message: String,
    },

    /// The requested entry does not exist on the remote.
    #[error("remote entry not found: {0}")]
    NotFound(String),
}

/// Structured error body returned by the remote API for non-2xx responses.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Operations the Remote Watcher, Merger, and Sync Executor use to talk to
/// the remote store.
///
/// Kept as a trait so tests can substitute an in-memory fake without
/// standing up an HTTP server.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// List the immediate children of the folder at `path`.
    ///
    /// # Errors
    /// Returns [`ProtocolError`] on transport failure or malformed response.
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, ProtocolError>;

    /// Fetch metadata for a single path.
    ///
    /// # Errors
    /// Returns [`ProtocolError::NotFound`] if no entry exists at `path`.
    async fn stat(&self, path: &str) -> Result<RemoteEntry, ProtocolError>;

    /// Upload `local_path`'s contents as a new file at `path`, sending
    /// `content_md5` as the `Content-MD5` header so the remote can reject
    /// a corrupted upload.
    ///
    /// # Errors
    /// Returns [`ProtocolError`] on transport failure, or [`ProtocolError::Api`]
    /// if the remote rejects the digest.
    async fn create_file(
        &self,
        path: &str,
        local_path: &Path,
        content_md5: &str,
    ) -> Result<RemoteEntry, ProtocolError>;

    /// Create a folder at `path`.
    ///
    /// # Errors
    /// Returns [`ProtocolError`] on transport failure.
    async fn create_dir(&self, path: &str) -> Result<RemoteEntry, ProtocolError>;

    /// Rename or relocate the entry `id` to `new_path`.
    ///
    /// # Errors
    /// Returns [`ProtocolError::NotFound`] if `id` does not exist.
    async fn rename(&self, id: &str, new_path: &str) -> Result<RemoteEntry, ProtocolError>;

    /// Move the entry `id` to the remote trash.
    ///
    /// # Errors
    /// Returns [`ProtocolError::NotFound`] if `id` does not exist.
    async fn trash(&self, id: &str) -> Result<(), ProtocolError>;

    /// Restore a previously trashed entry `id`.
    ///
    /// # Errors
    /// Returns [`ProtocolError::NotFound`] if `id` is not in the trash.
    async fn restore(&self, id: &str) -> Result<RemoteEntry, ProtocolError>;

    /// Long-poll the change feed for changes after `since`, waiting up to
    /// `timeout` for at least one change before returning an empty page.
    ///
    /// # Errors
    /// Returns [`ProtocolError`] on transport failure or malformed response.
    async fn changes(&self, since: u64, timeout: Duration) -> Result<ChangesPage, ProtocolError>;

    /// Download the file at `path`'s content into `dest`.
    ///
    /// # Errors
    /// Returns [`ProtocolError::NotFound`] if `path` doesn't exist, or
    /// [`ProtocolError`] if the write to `dest` fails.
    async fn download(&self, path: &str, dest: &Path) -> Result<(), ProtocolError>;

    /// Fetch the account's current storage usage and quota.
    ///
    /// # Errors
    /// Returns [`ProtocolError`] on transport failure or malformed response.
    async fn disk_usage(&self) -> Result<DiskUsageInfo, ProtocolError>;
}

/// `reqwest`-backed [`RemoteClient`] implementation.
pub struct HttpRemoteClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpRemoteClient {
    /// Build a client against `base_url`, authenticating every request with
    /// a bearer `token`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProtocolError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status.as_u16() == 404 {
            return Err(ProtocolError::NotFound(resp.url().to_string()));
        }
        let message = resp
            .json::<ApiErrorBody>()
            .await
            .map(|b| b.message)
            .unwrap_or_else(|_| status.to_string());
        Err(ProtocolError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, ProtocolError> {
        let resp = self
            .http
            .get(self.url("/list"))
            .bearer_auth(&self.token)
            .query(&[("path", path)])
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn stat(&self, path: &str) -> Result<RemoteEntry, ProtocolError> {
        let resp = self
            .http
            .get(self.url("/stat"))
            .bearer_auth(&self.token)
            .query(&[("path", path)])
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn create_file(
        &self,
        path: &str,
        local_path: &Path,
        content_md5: &str,
    ) -> Result<RemoteEntry, ProtocolError> {
        let body = tokio::fs::read(local_path)
            .await
            .map_err(|e| ProtocolError::Api {
                status: 0,
                message: e.to_string(),
            })?;
        let resp = self
            .http
            .post(self.url("/files"))
            .bearer_auth(&self.token)
            .header("Content-MD5", content_md5)
            .query(&[("path", path)])
            .body(body)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn create_dir(&self, path: &str) -> Result<RemoteEntry, ProtocolError> {
        let resp = self
            .http
            .post(self.url("/dirs"))
            .bearer_auth(&self.token)
            .query(&[("path", path)])
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn rename(&self, id: &str, new_path: &str) -> Result<RemoteEntry, ProtocolError> {
        let resp = self
            .http
            .patch(self.url(&format!("/entries/{id}")))
            .bearer_auth(&self.token)
            .query(&[("path", new_path)])
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn trash(&self, id: &str) -> Result<(), ProtocolError> {
        let resp = self
            .http
            .post(self.url(&format!("/entries/{id}/trash")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    async fn restore(&self, id: &str) -> Result<RemoteEntry, ProtocolError> {
        let resp = self
            .http
            .post(self.url(&format!("/entries/{id}/restore")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn changes(&self, since: u64, timeout: Duration) -> Result<ChangesPage, ProtocolError> {
        let resp = self
            .http
            .get(self.url("/changes"))
            .bearer_auth(&self.token)
            .query(&[("since", since.to_string())])
            .timeout(timeout)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn download(&self, path: &str, dest: &Path) -> Result<(), ProtocolError> {
        let resp = self
            .http
            .get(self.url("/content"))
            .bearer_auth(&self.token)
            .query(&[("path", path)])
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        let bytes = resp.bytes().await?;
        debug!(path, bytes = bytes.len(), "downloaded remote content");
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| ProtocolError::Api {
                status: 0,
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn disk_usage(&self) -> Result<DiskUsageInfo, ProtocolError> {
        let resp = self
            .http
            .get(self.url("/usage"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }
}
