// SPDX-License-Identifier: MIT OR Apache-2.0
//! Local filesystem watcher: turns raw OS notifications into a normalized
//! event stream, reconstructing moves that the OS reports as an
//! unconnected delete/create pair.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod reconcile;

use chrono::{DateTime, Utc};
use cozy_metadata::{DocType, Document, MetadataStore, Side};
use cozy_path::Platform;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use reconcile::{RawKind, RawObservation, Window};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A local filesystem stat snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// Size in bytes.
    pub size: u64,
    /// Last-modified time.
    pub mtime: DateTime<Utc>,
    /// Inode (POSIX) or file id (Windows), when the platform exposes one.
    pub ino: Option<u64>,
}

impl Default for Stat {
    fn default() -> Self {
        Self {
            size: 0,
            mtime: Utc::now(),
            ino: None,
        }
    }
}

/// A normalized local change, after move reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEvent {
    /// A new file appeared.
    AddFile {
        /// Canonical relative path.
        path: String,
        /// Stat at observation time.
        stat: Stat,
    },
    /// A new folder appeared.
    AddDir {
        /// Canonical relative path.
        path: String,
        /// Stat at observation time.
        stat: Stat,
    },
    /// An existing file's content changed.
    UpdateFile {
        /// Canonical relative path.
        path: String,
        /// Stat at observation time.
        stat: Stat,
    },
    /// A file or folder was renamed or relocated.
    Move {
        /// Path before the move.
        old_path: String,
        /// Path after the move.
        new_path: String,
        /// Stat of the entry at its new path.
        stat: Stat,
    },
    /// A file or folder was moved to the local trash.
    Trash {
        /// Canonical relative path it was removed from.
        path: String,
    },
    /// A previously trashed entry reappeared (restored from the trash).
    Untrash {
        /// Canonical relative path it reappeared at.
        path: String,
        /// Stat at observation time.
        stat: Stat,
    },
}

/// Errors raised while scanning or watching the local root.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The underlying OS watch could not be established.
    #[error("failed to watch {path}: {source}")]
    Watch {
        /// Path that failed to watch.
        path: String,
        /// Underlying `notify` error.
        #[source]
        source: notify::Error,
    },
    /// An I/O error occurred while scanning or stat'ing a path.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> WatchError {
    WatchError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Top-level directories under the sync root that belong to the core
/// itself rather than the user's tree: the metadata WAL, staging writes,
/// and the local trash. Neither the initial scan nor the live watcher
/// treats anything under these as a user change.
const INTERNAL_DIRS: [&str; 3] = [".cozy-state", ".cozy-tmp", ".Trash"];

fn is_internal_path(canonical: &str) -> bool {
    let first_segment = canonical.split('/').next().unwrap_or(canonical);
    INTERNAL_DIRS.contains(&first_segment)
}

/// Walks `root` and compares every entry against `metadata`, emitting
/// synthetic events for anything that disagrees: new entries the catalog
/// has never seen, files whose digest no longer matches, and catalog
/// entries whose path no longer exists on disk.
///
/// This reconciles changes made to the tree while the daemon was not
/// running.
///
/// # Errors
///
/// Returns [`WatchError::Io`] if the tree cannot be walked or a file
/// cannot be digested.
pub async fn initial_scan(
    root: &Path,
    metadata: &MetadataStore,
    platform: Platform,
) -> Result<Vec<LocalEvent>, WatchError> {
    let mut events = Vec::new();
    let mut seen_paths = std::collections::HashSet::new();

    for entry in walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
    {
        let abs_path = entry.path();
        if abs_path == root {
            continue;
        }
        let relative = abs_path
            .strip_prefix(root)
            .unwrap_or(abs_path)
            .to_string_lossy()
            .replace('\\', "/");
        let canonical = match cozy_path::canonicalize(&relative) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %relative, error = %e, "skipping path that escapes root");
                continue;
            }
        };
        if is_internal_path(&canonical) {
            continue;
        }
        seen_paths.insert(canonical.clone());

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %canonical, error = %e, "failed to stat during initial scan");
                continue;
            }
        };

        let doc_type = if meta.is_dir() { DocType::Folder } else { DocType::File };
        let stat = Stat {
            size: meta.len(),
            mtime: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
            ino: ino_of(&meta),
        };

        let existing = metadata.get_by_path(&canonical);
        match (existing, doc_type) {
            (None, DocType::Folder) => events.push(LocalEvent::AddDir { path: canonical, stat }),
            (None, DocType::File) => events.push(LocalEvent::AddFile { path: canonical, stat }),
            (Some(doc), DocType::File) if doc.doc_type == DocType::File => {
                let changed = doc
                    .local
                    .as_ref()
                    .map(|l| l.size != stat.size || l.mtime != stat.mtime)
                    .unwrap_or(true);
                if changed {
                    events.push(LocalEvent::UpdateFile { path: canonical, stat });
                }
            }
            _ => {}
        }
    }

    for doc in metadata.tree_under("") {
        if !seen_paths.contains(&doc.path) && !doc.deleted {
            events.push(LocalEvent::Trash { path: doc.path });
        }
    }

    Ok(events)
}

#[cfg(unix)]
fn ino_of(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn ino_of(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Drives a live `notify` watch over `root`, buffering observations into
/// aggregation [`Window`]s and emitting normalized [`LocalEvent`]s on a
/// channel.
pub struct LocalWatcher {
    root: PathBuf,
    platform: Platform,
    _handle: RecommendedWatcher,
}

impl LocalWatcher {
    /// Start watching `root` recursively, returning the watcher and a
    /// receiver that yields reconciled events as windows flush.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Watch`] if the OS-level watch cannot be
    /// established.
    pub fn spawn(
        root: PathBuf,
        platform: Platform,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LocalEvent>), WatchError> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<LocalEvent>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = raw_tx.send(event);
            }
        })
        .map_err(|e| WatchError::Watch {
            path: root.display().to_string(),
            source: e,
        })?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| WatchError::Watch {
                path: root.display().to_string(),
                source: e,
            })?;

        let watch_root = root.clone();
        let window_platform = platform;
        tokio::spawn(async move {
            let mut window = Window::open(window_platform);
            loop {
                let tick = tokio::time::sleep(reconcile::EXTENSION);
                tokio::select! {
                    maybe_event = raw_rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                for obs in to_observations(&watch_root, &event).await {
                                    window.observe(obs);
                                }
                            }
                            None => break,
                        }
                    }
                    () = tick => {}
                }

                if window.is_expired() {
                    let flushed = std::mem::replace(&mut window, Window::open(window_platform));
                    for ev in flushed.flush() {
                        debug!(?ev, "emitting reconciled local event");
                        if event_tx.send(ev).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        info!(root = %root.display(), "local watcher started");
        Ok((
            Self {
                root,
                platform,
                _handle: watcher,
            },
            event_rx,
        ))
    }

    /// The root path this watcher covers.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The platform this watcher is interpreting naming rules for.
    #[must_use]
    pub fn platform(&self) -> Platform {
        self.platform
    }
}

async fn to_observations(root: &Path, event: &Event) -> Vec<RawObservation> {
    let kind = match event.kind {
        EventKind::Create(_) => RawKind::Created,
        EventKind::Remove(_) => RawKind::Removed,
        EventKind::Modify(_) => RawKind::Modified,
        _ => return Vec::new(),
    };

    let mut out = Vec::with_capacity(event.paths.len());
    for abs_path in &event.paths {
        let relative = abs_path
            .strip_prefix(root)
            .unwrap_or(abs_path)
            .to_string_lossy()
            .replace('\\', "/");
        let Ok(path) = cozy_path::canonicalize(&relative) else {
            continue;
        };
        if is_internal_path(&path) {
            continue;
        }

        let (stat, is_dir) = match tokio::fs::metadata(abs_path).await {
            Ok(meta) => (
                Some(Stat {
                    size: meta.len(),
                    mtime: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
                    ino: ino_of(&meta),
                }),
                meta.is_dir(),
            ),
            Err(_) => (None, false),
        };

        let digest = if !is_dir && kind != RawKind::Removed {
            cozy_checksum::digest(abs_path).await.ok()
        } else {
            None
        };

        out.push(RawObservation {
            path,
            kind,
            stat,
            digest,
            is_dir,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cozy_path::id as path_id;
    use tempfile::tempdir;

    #[tokio::test]
    async fn initial_scan_reports_untracked_file_as_add() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let store = MetadataStore::in_memory();
        let events = initial_scan(dir.path(), &store, Platform::Linux).await.unwrap();
        assert!(matches!(&events[..], [LocalEvent::AddFile { path, .. }] if path == "a.txt"));
    }

    #[tokio::test]
    async fn initial_scan_skips_internal_directories() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".cozy-state")).unwrap();
        std::fs::write(dir.path().join(".cozy-state/catalog.wal"), b"wal bytes").unwrap();
        std::fs::create_dir_all(dir.path().join(".cozy-tmp")).unwrap();
        std::fs::write(dir.path().join(".cozy-tmp/foo.part"), b"partial").unwrap();
        std::fs::create_dir_all(dir.path().join(".Trash")).unwrap();
        std::fs::write(dir.path().join(".Trash/old.txt"), b"trashed").unwrap();
        std::fs::write(dir.path().join("real.txt"), b"hello").unwrap();

        let store = MetadataStore::in_memory();
        let events = initial_scan(dir.path(), &store, Platform::Linux).await.unwrap();
        assert!(matches!(&events[..], [LocalEvent::AddFile { path, .. }] if path == "real.txt"));
    }

    #[tokio::test]
    async fn initial_scan_reports_missing_catalog_entry_as_trash() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::in_memory();
        let canonical = cozy_path::canonicalize("gone.txt").unwrap();
        let id = path_id(&canonical, Platform::Linux);
        store
            .put(Document::new(id, canonical, DocType::File, Side::Local))
            .unwrap();

        let events = initial_scan(dir.path(), &store, Platform::Linux).await.unwrap();
        assert!(matches!(&events[..], [LocalEvent::Trash { path }] if path == "gone.txt"));
    }

    #[tokio::test]
    async fn initial_scan_is_quiet_when_catalog_matches_disk() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"hello").unwrap();
        let meta = std::fs::metadata(&file_path).unwrap();

        let store = MetadataStore::in_memory();
        let canonical = cozy_path::canonicalize("a.txt").unwrap();
        let id = path_id(&canonical, Platform::Linux);
        let mut doc = Document::new(id, canonical, DocType::File, Side::Local);
        doc.local = Some(cozy_metadata::LocalSnapshot {
            size: meta.len(),
            mtime: meta.modified().map(DateTime::<Utc>::from).unwrap(),
            ino: ino_of(&meta),
        });
        store.put(doc).unwrap();

        let events = initial_scan(dir.path(), &store, Platform::Linux).await.unwrap();
        assert!(events.is_empty());
    }
}
