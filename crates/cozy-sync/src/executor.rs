// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Sync Executor: drains dirty documents from the catalog and mirrors
//! each one onto whichever side is behind.

use crate::locks::PathLocks;
use crate::local_side::LocalSide;
use crate::operation::{classify, Operation};
use crate::progress::ProgressEvent;
use crate::remote_side::RemoteSide;
use crate::retry;
use crate::ExecError;
use cozy_config::RetryConfig;
use cozy_error::ErrorCategory;
use cozy_merge::LockCheck;
use cozy_metadata::{Document, DocType, MetadataStore, Side};
use cozy_path::{DocId, Platform};
use cozy_protocol::RemoteClient;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::warn;

/// How often the run loop re-scans the catalog for newly dirty documents.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default number of documents mirrored concurrently.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Order a batch of dirty documents for execution: deletions deepest-first
/// (children removed before their parents), everything else shallowest-first
/// (parents created before their children), stable by revision within each
/// group.
pub fn order_for_execution(docs: &mut [Document]) {
    docs.sort_by_key(|d| (execution_rank(d), d.rev));
}

fn path_depth(path: &str) -> i64 {
    path.split('/').filter(|s| !s.is_empty()).count() as i64
}

fn execution_rank(doc: &Document) -> (i32, i64) {
    let depth = path_depth(&doc.path);
    if doc.deleted {
        (1, -depth)
    } else {
        (0, depth)
    }
}

/// Drains [`MetadataStore::dirty`] and mirrors each dirty side, with a
/// bounded worker pool, per-document locking, and exponential-backoff
/// retry on transient failures.
pub struct Executor {
    metadata: Arc<MetadataStore>,
    local: Arc<LocalSide>,
    remote: Arc<RemoteSide>,
    remote_client: Arc<dyn RemoteClient>,
    locks: Arc<PathLocks>,
    retry_config: RetryConfig,
    progress: tokio::sync::broadcast::Sender<ProgressEvent>,
    stop_tx: watch::Sender<bool>,
    concurrency: usize,
    platform: Platform,
    next_attempt: Mutex<HashMap<DocId, Instant>>,
}

impl Executor {
    /// Build an executor over `metadata`, mirroring between `local_root`
    /// and `remote_client`.
    #[must_use]
    pub fn new(
        metadata: Arc<MetadataStore>,
        local_root: std::path::PathBuf,
        remote_client: Arc<dyn RemoteClient>,
        locks: Arc<PathLocks>,
        retry_config: RetryConfig,
        progress: tokio::sync::broadcast::Sender<ProgressEvent>,
        stop_tx: watch::Sender<bool>,
        platform: Platform,
    ) -> Self {
        Self {
            metadata,
            local: Arc::new(LocalSide::new(local_root)),
            remote: Arc::new(RemoteSide::new(remote_client.clone())),
            remote_client,
            locks,
            retry_config,
            progress,
            stop_tx,
            concurrency: DEFAULT_CONCURRENCY,
            platform,
            next_attempt: Mutex::new(HashMap::new()),
        }
    }

    /// Run the drain loop until the stop signal fires.
    pub async fn run(self: Arc<Self>) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.concurrency));
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow() {
                break;
            }

            let mut dirty = self.metadata.dirty();
            order_for_execution(&mut dirty);
            let now = Instant::now();

            for doc in dirty {
                if self.locks.is_locked(&doc.id) {
                    continue;
                }
                let due = self.next_attempt.lock().unwrap().get(&doc.id).copied();
                if let Some(due) = due {
                    if due > now {
                        continue;
                    }
                }
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                let this = Arc::clone(&self);
                let id = doc.id.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    this.process_one(id).await;
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn process_one(self: Arc<Self>, id: DocId) {
        let _guard = self.locks.acquire(id.clone()).await;
        let Some(doc) = self.metadata.get_by_id(&id) else {
            return;
        };
        if !doc.is_dirty() {
            return;
        }

        for side in doc.dirty_sides() {
            if let Err(err) = self.apply(&doc, side).await {
                self.handle_error(&doc, err).await;
                return;
            }
            if let Err(err) = self.metadata.advance_side(&doc.id, side) {
                warn!(error = %err, id = %doc.id, "failed to advance side after a successful apply");
                return;
            }
        }

        match self.metadata.purge_if_fully_deleted(&doc.id) {
            Ok(true) => {}
            Ok(false) => {}
            Err(err) => warn!(error = %err, id = %doc.id, "failed to purge fully-deleted document"),
        }
        self.next_attempt.lock().unwrap().remove(&doc.id);

        if self.metadata.dirty().is_empty() {
            let _ = self.progress.send(ProgressEvent::UpToDate);
        }
    }

    async fn apply(&self, doc: &Document, side: Side) -> Result<(), ExecError> {
        let op = classify(doc);
        match (side, op) {
            (Side::Remote, Operation::EnsureFolder) => {
                let _ = self.progress.send(ProgressEvent::TransferStarted {
                    path: doc.path.clone(),
                });
                self.remote.ensure_folder(&doc.path).await
            }
            (Side::Remote, Operation::EnsureFile) => {
                let _ = self.progress.send(ProgressEvent::TransferStarted {
                    path: doc.path.clone(),
                });
                let local_path = self.local.resolve(&doc.path);
                let entry = self.remote.ensure_file_from_local(&doc.path, &local_path).await?;
                let _ = self.progress.send(ProgressEvent::TransferCopy {
                    path: doc.path.clone(),
                    bytes: entry.size.unwrap_or(0),
                });
                Ok(())
            }
            (Side::Remote, Operation::Move { old_path }) => {
                match doc.remote.as_ref() {
                    Some(snapshot) => {
                        self.remote.rename(&snapshot.remote_id, &doc.path).await?;
                    }
                    None => self.create_fresh_remote(doc).await?,
                }
                let _ = self.progress.send(ProgressEvent::TransferMove {
                    new: doc.path.clone(),
                    old: old_path,
                });
                Ok(())
            }
            (Side::Remote, Operation::Trash) => {
                if let Some(snapshot) = doc.remote.as_ref() {
                    self.remote.trash(&snapshot.remote_id).await?;
                }
                let _ = self.progress.send(ProgressEvent::DeleteFile {
                    path: doc.path.clone(),
                });
                Ok(())
            }
            (Side::Local, Operation::EnsureFolder) => {
                let _ = self.progress.send(ProgressEvent::TransferStarted {
                    path: doc.path.clone(),
                });
                self.local.ensure_folder(&doc.path).await
            }
            (Side::Local, Operation::EnsureFile) => {
                let _ = self.progress.send(ProgressEvent::TransferStarted {
                    path: doc.path.clone(),
                });
                let bytes = self
                    .local
                    .ensure_file_from_remote(&doc.path, &doc.path, &self.remote_client)
                    .await?;
                let _ = self.progress.send(ProgressEvent::TransferCopy {
                    path: doc.path.clone(),
                    bytes,
                });
                Ok(())
            }
            (Side::Local, Operation::Move { old_path }) => {
                let old_exists = tokio::fs::try_exists(self.local.resolve(&old_path))
                    .await
                    .unwrap_or(false);
                if old_exists {
                    self.local.rename(&old_path, &doc.path).await?;
                } else {
                    self.create_fresh_local(doc).await?;
                }
                let _ = self.progress.send(ProgressEvent::TransferMove {
                    new: doc.path.clone(),
                    old: old_path,
                });
                Ok(())
            }
            (Side::Local, Operation::Trash) => {
                self.local.trash(&doc.path).await?;
                let _ = self.progress.send(ProgressEvent::DeleteFile {
                    path: doc.path.clone(),
                });
                Ok(())
            }
        }
    }

    async fn create_fresh_remote(&self, doc: &Document) -> Result<(), ExecError> {
        match doc.doc_type {
            DocType::Folder => self.remote.ensure_folder(&doc.path).await,
            DocType::File => {
                let local_path = self.local.resolve(&doc.path);
                self.remote.ensure_file_from_local(&doc.path, &local_path).await?;
                Ok(())
            }
        }
    }

    async fn create_fresh_local(&self, doc: &Document) -> Result<(), ExecError> {
        match doc.doc_type {
            DocType::Folder => self.local.ensure_folder(&doc.path).await,
            DocType::File => {
                self.local
                    .ensure_file_from_remote(&doc.path, &doc.path, &self.remote_client)
                    .await?;
                Ok(())
            }
        }
    }

    async fn handle_error(&self, doc: &Document, err: ExecError) {
        let category = err.code().category();
        match category {
            ErrorCategory::Transient => {
                let updated = self
                    .metadata
                    .record_error(&doc.id)
                    .unwrap_or_else(|_| doc.clone());
                if updated.errors >= self.retry_config.max_attempts {
                    let _ = self.progress.send(ProgressEvent::SyncError(format!(
                        "giving up on {} after {} attempts: {err}",
                        doc.path, updated.errors
                    )));
                    return;
                }
                let delay = retry::compute_delay(&self.retry_config, updated.errors.saturating_sub(1));
                self.next_attempt
                    .lock()
                    .unwrap()
                    .insert(doc.id.clone(), Instant::now() + delay);
            }
            ErrorCategory::Incompatible => {
                let findings = cozy_path::check(&doc.path, doc.doc_type, self.platform);
                let _ = self.progress.send(ProgressEvent::PlatformIncompatibilities(findings));
            }
            ErrorCategory::Revoked | ErrorCategory::Quota | ErrorCategory::Corrupt => {
                let _ = self.stop_tx.send(true);
                let _ = self.progress.send(ProgressEvent::SyncError(err.to_string()));
            }
            ErrorCategory::Conflict | ErrorCategory::Internal => {
                let _ = self.progress.send(ProgressEvent::SyncError(err.to_string()));
            }
        }
    }
}
