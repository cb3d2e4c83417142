// SPDX-License-Identifier: MIT OR Apache-2.0
//! The sync core handle: owns the catalog, both watchers, the executor,
//! and the progress/shutdown channels a shell drives the whole thing
//! through.

use crate::executor::Executor;
use crate::locks::PathLocks;
use crate::progress::ProgressEvent;
use cozy_config::SyncConfig;
use cozy_merge::{apply_folder_move, merge, ChangeKind, IncomingChange, MergeError};
use cozy_metadata::{DocType, MetadataError, MetadataStore, Side};
use cozy_path::Platform;
use cozy_protocol::{DiskUsageInfo, ProtocolError, RemoteClient, DEFAULT_LONGPOLL_TIMEOUT};
use cozy_watch_local::{initial_scan, LocalEvent, LocalWatcher, WatchError};
use cozy_watch_remote::{batch as batch_remote_changes, normalize as normalize_remote_change};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Failures raised while starting, running, or stopping the core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The metadata catalog could not be opened or written.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// The local watcher could not be established.
    #[error(transparent)]
    Watch(#[from] WatchError),
    /// The remote API rejected a request.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// A local filesystem error occurred managing sync-state files.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn state_dir(root: &Path) -> std::path::PathBuf {
    root.join(".cozy-state")
}

async fn read_cursor(root: &Path) -> u64 {
    let path = state_dir(root).join("remote-cursor");
    match tokio::fs::read_to_string(&path).await {
        Ok(s) => s.trim().parse().unwrap_or(0),
        Err(_) => 0,
    }
}

async fn write_cursor(root: &Path, cursor: u64) -> std::io::Result<()> {
    let dir = state_dir(root);
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join("remote-cursor"), cursor.to_string()).await
}

async fn local_event_to_change(root: &Path, metadata: &MetadataStore, event: LocalEvent) -> IncomingChange {
    async fn digest_of(root: &Path, rel: &str) -> Option<String> {
        cozy_checksum::digest(&root.join(rel))
            .await
            .ok()
            .map(|d| d.as_str().to_string())
    }
    async fn is_dir(root: &Path, rel: &str) -> bool {
        tokio::fs::metadata(root.join(rel))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    match event {
        LocalEvent::AddFile { path, stat } => {
            let digest = digest_of(root, &path).await;
            IncomingChange {
                side: Side::Local,
                path,
                doc_type: DocType::File,
                kind: ChangeKind::Add,
                digest,
                size: Some(stat.size),
                ino: stat.ino,
                remote_id: None,
            }
        }
        LocalEvent::AddDir { path, stat } => IncomingChange {
            side: Side::Local,
            path,
            doc_type: DocType::Folder,
            kind: ChangeKind::Add,
            digest: None,
            size: Some(stat.size),
            ino: stat.ino,
            remote_id: None,
        },
        LocalEvent::UpdateFile { path, stat } => {
            let digest = digest_of(root, &path).await;
            IncomingChange {
                side: Side::Local,
                path,
                doc_type: DocType::File,
                kind: ChangeKind::Update,
                digest,
                size: Some(stat.size),
                ino: stat.ino,
                remote_id: None,
            }
        }
        LocalEvent::Move { old_path, new_path, stat } => {
            let doc_type = if is_dir(root, &new_path).await { DocType::Folder } else { DocType::File };
            let digest = if doc_type == DocType::File { digest_of(root, &new_path).await } else { None };
            IncomingChange {
                side: Side::Local,
                path: new_path,
                doc_type,
                kind: ChangeKind::Move { old_path },
                digest,
                size: Some(stat.size),
                ino: stat.ino,
                remote_id: None,
            }
        }
        LocalEvent::Trash { path } => {
            let doc_type = metadata.get_by_path(&path).map(|d| d.doc_type).unwrap_or(DocType::File);
            IncomingChange {
                side: Side::Local,
                path,
                doc_type,
                kind: ChangeKind::Trash,
                digest: None,
                size: None,
                ino: None,
                remote_id: None,
            }
        }
        LocalEvent::Untrash { path, stat } => {
            let doc_type = if is_dir(root, &path).await { DocType::Folder } else { DocType::File };
            let digest = if doc_type == DocType::File { digest_of(root, &path).await } else { None };
            IncomingChange {
                side: Side::Local,
                path,
                doc_type,
                kind: ChangeKind::Restore,
                digest,
                size: Some(stat.size),
                ino: stat.ino,
                remote_id: None,
            }
        }
    }
}

/// Merge one normalized change, routing folder moves through the batch
/// descendant-rewrite path instead of the single-document path.
fn apply_change(metadata: &MetadataStore, locks: &PathLocks, change: IncomingChange) -> Result<(), MergeError> {
    if let ChangeKind::Move { old_path } = &change.kind {
        if change.doc_type == DocType::Folder {
            apply_folder_move(metadata, old_path, &change.path, change.side, locks)?;
            return Ok(());
        }
    }
    merge(metadata, change)?;
    Ok(())
}

/// Bundles the catalog, both watchers, and the executor into one
/// handle a shell starts, subscribes to, and stops.
pub struct Core {
    metadata: Arc<MetadataStore>,
    config: SyncConfig,
    remote_client: Arc<dyn RemoteClient>,
    locks: Arc<PathLocks>,
    executor: Arc<Executor>,
    progress_tx: broadcast::Sender<ProgressEvent>,
    stop_tx: watch::Sender<bool>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl Core {
    /// Open the catalog under `config.sync_root` and build a core ready to
    /// [`start`](Self::start).
    ///
    /// # Errors
    /// Returns [`CoreError::Metadata`] if the write-ahead log cannot be
    /// opened or replayed.
    pub fn new(config: SyncConfig, remote_client: Arc<dyn RemoteClient>) -> Result<Self, CoreError> {
        let metadata = Arc::new(MetadataStore::open(state_dir(&config.sync_root).join("catalog.wal"))?);
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        let (stop_tx, _) = watch::channel(false);
        let locks = Arc::new(PathLocks::new());
        let platform = config.case_sensitive_override.map_or_else(Platform::host, |case_sensitive| {
            if case_sensitive { Platform::Linux } else { Platform::MacOs }
        });
        let executor = Arc::new(Executor::new(
            Arc::clone(&metadata),
            config.sync_root.clone(),
            Arc::clone(&remote_client),
            Arc::clone(&locks),
            config.retry.clone(),
            progress_tx.clone(),
            stop_tx.clone(),
            platform,
        ));

        Ok(Self {
            metadata,
            config,
            remote_client,
            locks,
            executor,
            progress_tx,
            stop_tx,
            tasks: AsyncMutex::new(Vec::new()),
        })
    }

    /// Subscribe to the progress event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    /// Current sync root.
    #[must_use]
    pub fn sync_root(&self) -> &Path {
        &self.config.sync_root
    }

    /// Number of documents currently tracked.
    #[must_use]
    pub fn catalog_size(&self) -> usize {
        self.metadata.len()
    }

    /// Reconcile the local tree against the catalog, emitting synthetic
    /// events for anything that drifted while the core was not running.
    ///
    /// # Errors
    /// Returns [`CoreError::Watch`] if the tree cannot be walked.
    pub async fn full_synchronize(&self) -> Result<(), CoreError> {
        let platform = self.executor_platform();
        let events = initial_scan(&self.config.sync_root, &self.metadata, platform).await?;
        for event in events {
            let change = local_event_to_change(&self.config.sync_root, &self.metadata, event).await;
            if let Err(err) = apply_change(&self.metadata, &self.locks, change) {
                warn!(error = %err, "failed to merge reconciled change during full synchronize");
            }
        }
        Ok(())
    }

    fn executor_platform(&self) -> Platform {
        self.config.case_sensitive_override.map_or_else(Platform::host, |case_sensitive| {
            if case_sensitive { Platform::Linux } else { Platform::MacOs }
        })
    }

    /// Fetch the account's current remote storage usage.
    ///
    /// # Errors
    /// Returns [`CoreError::Protocol`] on transport failure.
    pub async fn disk_usage(&self) -> Result<DiskUsageInfo, CoreError> {
        Ok(self.remote_client.disk_usage().await?)
    }

    /// Start the local watcher, remote watcher, merge consumers, and
    /// executor as background tasks.
    ///
    /// # Errors
    /// Returns [`CoreError::Watch`] if the initial scan or the OS-level
    /// watch fails to start.
    pub async fn start(self: &Arc<Self>) -> Result<(), CoreError> {
        let platform = self.executor_platform();
        let root = self.config.sync_root.clone();

        let initial = initial_scan(&root, &self.metadata, platform).await?;
        for event in initial {
            let change = local_event_to_change(&root, &self.metadata, event).await;
            if let Err(err) = apply_change(&self.metadata, &self.locks, change) {
                warn!(error = %err, "failed to merge change from the initial scan");
            }
        }

        let (watcher, mut local_rx) = LocalWatcher::spawn(root.clone(), platform)?;
        let mut tasks = self.tasks.lock().await;

        {
            let this = Arc::clone(self);
            let watch_root = watcher.root().to_path_buf();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = local_rx.recv().await {
                    let change = local_event_to_change(&watch_root, &this.metadata, event).await;
                    if let Err(err) = apply_change(&this.metadata, &this.locks, change) {
                        warn!(error = %err, "failed to merge local change");
                    }
                }
            }));
        }
        // Keep the watcher's notify handle alive for the lifetime of the core.
        tasks.push(tokio::spawn(async move {
            let _watcher = watcher;
            std::future::pending::<()>().await;
        }));

        {
            let this = Arc::clone(self);
            let cursor_root = root.clone();
            let client = Arc::clone(&self.remote_client);
            let mut stop_rx = self.stop_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut cursor = read_cursor(&cursor_root).await;
                loop {
                    if *stop_rx.borrow() {
                        return;
                    }
                    tokio::select! {
                        page = client.changes(cursor, DEFAULT_LONGPOLL_TIMEOUT) => {
                            match page {
                                Ok(page) => {
                                    let ordered = batch_remote_changes(page.changes);
                                    for raw in &ordered {
                                        if let Some(change) = normalize_remote_change(raw) {
                                            debug!(path = %change.path, "applying remote change");
                                            if let Err(err) = apply_change(&this.metadata, &this.locks, change) {
                                                warn!(error = %err, "failed to merge remote change");
                                            }
                                        }
                                    }
                                    cursor = page.last_seq;
                                    if let Err(err) = write_cursor(&cursor_root, cursor).await {
                                        warn!(error = %err, "failed to persist remote change cursor");
                                    }
                                }
                                Err(err) => {
                                    warn!(error = %err, cursor, "remote poll failed, backing off");
                                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                                }
                            }
                        }
                        _ = stop_rx.changed() => {
                            return;
                        }
                    }
                }
            }));
        }

        {
            let executor = Arc::clone(&self.executor);
            tasks.push(tokio::spawn(async move {
                executor.run().await;
            }));
        }

        info!(root = %root.display(), "sync core started");
        Ok(())
    }

    /// Signal every background task to stop, persist durable state, and
    /// wait for them to finish.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        if let Err(err) = self
            .metadata
            .persist_last_files(&state_dir(&self.config.sync_root).join("last-files.json"))
        {
            error!(error = %err, "failed to persist last-files ledger on stop");
        }
        info!("sync core stopped");
    }
}
