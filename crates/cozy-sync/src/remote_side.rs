// SPDX-License-Identifier: MIT OR Apache-2.0
//! Mutating operations the Executor applies to the remote side.

use crate::ExecError;
use cozy_protocol::{RemoteClient, RemoteEntry};
use std::path::Path;
use std::sync::Arc;

/// Thin wrapper over a [`RemoteClient`] exposing the handful of mutating
/// calls the Executor needs, independent of the HTTP transport.
pub struct RemoteSide {
    client: Arc<dyn RemoteClient>,
}

impl RemoteSide {
    /// Drive remote mutations through `client`.
    #[must_use]
    pub fn new(client: Arc<dyn RemoteClient>) -> Self {
        Self { client }
    }

    /// Stabilize and digest `local_path`, then upload it as `path`'s
    /// content.
    ///
    /// # Errors
    /// Returns [`ExecError::Checksum`] if the file never stabilizes, or
    /// [`ExecError::Protocol`] if the upload is rejected.
    pub async fn ensure_file_from_local(
        &self,
        path: &str,
        local_path: &Path,
    ) -> Result<RemoteEntry, ExecError> {
        cozy_checksum::stabilize(
            local_path,
            cozy_checksum::DEFAULT_STABILIZE_ATTEMPTS,
            cozy_checksum::DEFAULT_STABILIZE_INTERVAL,
        )
        .await?;
        let digest = cozy_checksum::digest(local_path).await?;
        let entry = self
            .client
            .create_file(path, local_path, digest.as_str())
            .await?;
        Ok(entry)
    }

    /// Create a folder at `path`.
    ///
    /// # Errors
    /// Returns [`ExecError::Protocol`] on transport failure.
    pub async fn ensure_folder(&self, path: &str) -> Result<(), ExecError> {
        self.client.create_dir(path).await?;
        Ok(())
    }

    /// Rename the entry identified by `remote_id` to `new_path`.
    ///
    /// # Errors
    /// Returns [`ExecError::Protocol`] if `remote_id` doesn't exist.
    pub async fn rename(&self, remote_id: &str, new_path: &str) -> Result<(), ExecError> {
        self.client.rename(remote_id, new_path).await?;
        Ok(())
    }

    /// Move the entry identified by `remote_id` to the remote trash.
    ///
    /// # Errors
    /// Returns [`ExecError::Protocol`] if `remote_id` doesn't exist.
    pub async fn trash(&self, remote_id: &str) -> Result<(), ExecError> {
        self.client.trash(remote_id).await?;
        Ok(())
    }
}
