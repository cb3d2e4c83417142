// SPDX-License-Identifier: MIT OR Apache-2.0
//! Mutating operations the Executor applies to the local filesystem side.

use crate::ExecError;
use cozy_protocol::RemoteClient;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Applies document mutations under a sync root, staging downloads in a
/// hidden scratch directory and trashing into a hidden `.Trash` folder so
/// a removed file can be cheaply restored later.
pub struct LocalSide {
    root: PathBuf,
}

impl LocalSide {
    /// Operate against files rooted at `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The sync root this side writes into.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(".cozy-tmp")
    }

    fn trash_dir(&self) -> PathBuf {
        self.root.join(".Trash")
    }

    /// Create `rel`'s directory, and any missing parents.
    ///
    /// # Errors
    /// Returns [`ExecError::Io`] if the directory cannot be created.
    pub async fn ensure_folder(&self, rel: &str) -> Result<(), ExecError> {
        tokio::fs::create_dir_all(self.abs(rel)).await?;
        Ok(())
    }

    /// Materialize `rel`'s content from `remote`, preferring a cheap
    /// restore from the local trash over a fresh download when the entry
    /// is still sitting there from a previous trash.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    /// Returns [`ExecError::Io`] if staging or placing the file fails, or
    /// whatever [`RemoteClient::download`] returns on transport failure.
    pub async fn ensure_file_from_remote(
        &self,
        rel: &str,
        remote_path: &str,
        remote: &Arc<dyn RemoteClient>,
    ) -> Result<u64, ExecError> {
        let trashed = self.trash_dir().join(rel);
        if tokio::fs::try_exists(&trashed).await.unwrap_or(false) {
            if let Some(parent) = self.abs(rel).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&trashed, self.abs(rel)).await?;
            debug!(path = rel, "restored local file from trash");
            let meta = tokio::fs::metadata(self.abs(rel)).await?;
            return Ok(meta.len());
        }

        tokio::fs::create_dir_all(self.staging_dir()).await?;
        let tmp = self
            .staging_dir()
            .join(format!("{}.part", TMP_COUNTER.fetch_add(1, Ordering::Relaxed)));
        remote.download(remote_path, &tmp).await?;
        if let Some(parent) = self.abs(rel).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&tmp, self.abs(rel)).await?;
        let meta = tokio::fs::metadata(self.abs(rel)).await?;
        Ok(meta.len())
    }

    /// The absolute path `rel` resolves to, for the remote side to read
    /// when uploading.
    #[must_use]
    pub fn resolve(&self, rel: &str) -> PathBuf {
        self.abs(rel)
    }

    /// Rename `old_rel` to `new_rel`, falling back to copy-then-delete if
    /// the rename fails (e.g. the staging dir lives on another device).
    ///
    /// # Errors
    /// Returns [`ExecError::Io`] if both the rename and the fallback fail.
    pub async fn rename(&self, old_rel: &str, new_rel: &str) -> Result<(), ExecError> {
        if let Some(parent) = self.abs(new_rel).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::rename(self.abs(old_rel), self.abs(new_rel)).await {
            Ok(()) => Ok(()),
            Err(_) => {
                tokio::fs::copy(self.abs(old_rel), self.abs(new_rel)).await?;
                tokio::fs::remove_file(self.abs(old_rel)).await?;
                Ok(())
            }
        }
    }

    /// Move `rel` into the local trash, overwriting a stale trash entry
    /// at the same relative path if one exists.
    ///
    /// # Errors
    /// Returns [`ExecError::Io`] on failure other than the source already
    /// being gone (treated as success, since the end state matches).
    pub async fn trash(&self, rel: &str) -> Result<(), ExecError> {
        let dest = self.trash_dir().join(rel);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            let _ = tokio::fs::remove_file(&dest).await;
        }
        match tokio::fs::rename(self.abs(rel), &dest).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_folder_creates_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let side = LocalSide::new(dir.path().to_path_buf());
        side.ensure_folder("a/b/c").await.unwrap();
        assert!(dir.path().join("a/b/c").is_dir());
    }

    #[tokio::test]
    async fn rename_moves_file_and_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let side = LocalSide::new(dir.path().to_path_buf());
        tokio::fs::write(dir.path().join("a.txt"), b"hi").await.unwrap();
        side.rename("a.txt", "sub/b.txt").await.unwrap();
        assert!(!dir.path().join("a.txt").exists());
        assert_eq!(
            tokio::fs::read(dir.path().join("sub/b.txt")).await.unwrap(),
            b"hi"
        );
    }

    #[tokio::test]
    async fn trash_moves_file_into_hidden_trash_dir() {
        let dir = tempfile::tempdir().unwrap();
        let side = LocalSide::new(dir.path().to_path_buf());
        tokio::fs::write(dir.path().join("a.txt"), b"hi").await.unwrap();
        side.trash("a.txt").await.unwrap();
        assert!(!dir.path().join("a.txt").exists());
        assert!(dir.path().join(".Trash/a.txt").exists());
    }

    #[tokio::test]
    async fn trash_of_already_gone_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let side = LocalSide::new(dir.path().to_path_buf());
        side.trash("never-existed.txt").await.unwrap();
    }

    #[tokio::test]
    async fn ensure_file_from_remote_restores_from_trash_without_downloading() {
        let dir = tempfile::tempdir().unwrap();
        let side = LocalSide::new(dir.path().to_path_buf());
        tokio::fs::create_dir_all(dir.path().join(".Trash")).await.unwrap();
        tokio::fs::write(dir.path().join(".Trash/a.txt"), b"restored")
            .await
            .unwrap();

        struct PanicsOnDownload;
        #[async_trait::async_trait]
        impl RemoteClient for PanicsOnDownload {
            async fn list_dir(&self, _: &str) -> Result<Vec<cozy_protocol::RemoteEntry>, cozy_protocol::ProtocolError> {
                unreachable!()
            }
            async fn stat(&self, _: &str) -> Result<cozy_protocol::RemoteEntry, cozy_protocol::ProtocolError> {
                unreachable!()
            }
            async fn create_file(
                &self,
                _: &str,
                _: &Path,
                _: &str,
            ) -> Result<cozy_protocol::RemoteEntry, cozy_protocol::ProtocolError> {
                unreachable!()
            }
            async fn create_dir(&self, _: &str) -> Result<cozy_protocol::RemoteEntry, cozy_protocol::ProtocolError> {
                unreachable!()
            }
            async fn rename(&self, _: &str, _: &str) -> Result<cozy_protocol::RemoteEntry, cozy_protocol::ProtocolError> {
                unreachable!()
            }
            async fn trash(&self, _: &str) -> Result<(), cozy_protocol::ProtocolError> {
                unreachable!()
            }
            async fn restore(&self, _: &str) -> Result<cozy_protocol::RemoteEntry, cozy_protocol::ProtocolError> {
                unreachable!()
            }
            async fn changes(
                &self,
                _: u64,
                _: std::time::Duration,
            ) -> Result<cozy_protocol::ChangesPage, cozy_protocol::ProtocolError> {
                unreachable!()
            }
            async fn download(&self, _: &str, _: &Path) -> Result<(), cozy_protocol::ProtocolError> {
                panic!("should have restored from trash instead of downloading")
            }
            async fn disk_usage(&self) -> Result<cozy_protocol::DiskUsageInfo, cozy_protocol::ProtocolError> {
                unreachable!()
            }
        }

        let remote: Arc<dyn RemoteClient> = Arc::new(PanicsOnDownload);
        let bytes = side
            .ensure_file_from_remote("a.txt", "a.txt", &remote)
            .await
            .unwrap();
        assert_eq!(bytes, 8);
        assert_eq!(tokio::fs::read(dir.path().join("a.txt")).await.unwrap(), b"restored");
    }
}
