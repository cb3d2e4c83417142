// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable, revisioned document catalog.
//!
//! [`MetadataStore`] is the only shared mutable state between the two
//! watchers and the executor. It offers single-writer, many-reader
//! semantics over an in-memory index, backed by an append-only
//! write-ahead log so the catalog survives a crash: every [`put`](MetadataStore::put)
//! is fsynced before the caller is told the document was recorded.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use cozy_path::DocId;
pub use cozy_path::{DocType, Platform};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Maximum number of entries retained in the `last-files` ledger (§6).
pub const LAST_FILES_CAP: usize = 250;

/// A side's local or remote filesystem snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSnapshot {
    /// File size in bytes (0 for folders).
    pub size: u64,
    /// Last observed modification time.
    pub mtime: DateTime<Utc>,
    /// Inode / file id, used to reconstruct moves (invariant 5).
    pub ino: Option<u64>,
}

/// A remote-side snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    /// Remote-assigned identifier.
    pub remote_id: String,
    /// Remote-assigned revision number.
    pub remote_rev: u64,
}

/// Per-side propagation state: the `rev` at which each side last matched
/// the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Sides {
    /// Local side's last-matching revision.
    pub local: u64,
    /// Remote side's last-matching revision.
    pub remote: u64,
}

/// Which side of a [`Sides`] pair is being referred to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The local filesystem.
    Local,
    /// The remote cloud.
    Remote,
}

impl Side {
    /// The other side.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

impl Sides {
    /// The side value for `side`.
    #[must_use]
    pub fn get(&self, side: Side) -> u64 {
        match side {
            Side::Local => self.local,
            Side::Remote => self.remote,
        }
    }

    /// Set the side value for `side`.
    pub fn set(&mut self, side: Side, rev: u64) {
        match side {
            Side::Local => self.local = rev,
            Side::Remote => self.remote = rev,
        }
    }

    /// Whether `side` is up to date with `rev`.
    #[must_use]
    pub fn is_up_to_date(&self, side: Side, rev: u64) -> bool {
        self.get(side) == rev
    }

    /// Whether either side is dirty (behind `rev`).
    #[must_use]
    pub fn is_dirty(&self, rev: u64) -> bool {
        self.local < rev || self.remote < rev
    }
}

/// The unit stored by the catalog: one document per (path, kind).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable canonical-id primary key.
    pub id: DocId,
    /// Canonical forward-slash relative path as last observed.
    pub path: String,
    /// File or folder.
    pub doc_type: DocType,
    /// Monotonically increasing local revision of this document.
    pub rev: u64,
    /// Per-side propagation state.
    pub sides: Sides,
    /// Local snapshot, if the local side has ever observed this path.
    pub local: Option<LocalSnapshot>,
    /// Remote snapshot, if the remote side has ever observed this path.
    pub remote: Option<RemoteSnapshot>,
    /// Content digest for files; absent for folders.
    pub md5sum: Option<String>,
    /// Local inode or file identifier (denormalized from `local` for
    /// fast `by_ino` lookups).
    pub ino: Option<u64>,
    /// Descriptive tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Whether the file carries the executable bit.
    #[serde(default)]
    pub executable: bool,
    /// Free-form classification (e.g. "image", "document").
    pub class: Option<String>,
    /// MIME type, if known.
    pub mime: Option<String>,
    /// Size in bytes, denormalized from the most recent snapshot.
    pub size: Option<u64>,
    /// Last time this document was touched by either side.
    pub updated_at: DateTime<Utc>,
    /// Retry counter used by the Sync Executor.
    #[serde(default)]
    pub errors: u32,
    /// When this document represents a move in flight, the prior state
    /// for the opposite side to mirror.
    pub move_from: Option<Box<Document>>,
    /// Tombstone flag. Retained until both sides acknowledge the deletion.
    #[serde(default)]
    pub deleted: bool,
}

impl Document {
    /// Create a brand-new document at revision 1, with only `side` caught
    /// up (the side that first observed the resource).
    #[must_use]
    pub fn new(id: DocId, path: impl Into<String>, doc_type: DocType, observed_by: Side) -> Self {
        let mut sides = Sides::default();
        sides.set(observed_by, 1);
        Self {
            id,
            path: path.into(),
            doc_type,
            rev: 1,
            sides,
            local: None,
            remote: None,
            md5sum: None,
            ino: None,
            tags: Vec::new(),
            executable: false,
            class: None,
            mime: None,
            size: None,
            updated_at: Utc::now(),
            errors: 0,
            move_from: None,
            deleted: false,
        }
    }

    /// Whether this document has outstanding work for either side.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.sides.is_dirty(self.rev)
    }

    /// The side(s) that are behind `rev`, if any.
    #[must_use]
    pub fn dirty_sides(&self) -> Vec<Side> {
        [Side::Local, Side::Remote]
            .into_iter()
            .filter(|s| !self.sides.is_up_to_date(*s, self.rev))
            .collect()
    }
}

/// A monotonically increasing store-wide position in the change feed.
pub type Seq = u64;

/// Errors raised by [`MetadataStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// `put` was called with a revision that does not advance the stored
    /// document's revision.
    #[error("stale revision for {id}: incoming rev {incoming} <= stored rev {stored}")]
    StaleRevision {
        /// The document id.
        id: String,
        /// The incoming document's revision.
        incoming: u64,
        /// The currently stored document's revision.
        stored: u64,
    },
    /// Two distinct ids tried to claim the same canonical path.
    #[error("path {path} already claimed by a different id")]
    PathConflict {
        /// The contested path.
        path: String,
    },
    /// The write-ahead log could not be written or read.
    #[error("write-ahead log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// A log entry could not be deserialized during replay.
    #[error("corrupt write-ahead log entry: {0}")]
    Corrupt(String),
}

/// A single write-ahead log entry: either an upsert or a tombstone removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogEntry {
    Put(Document),
    Delete(DocId),
}

/// Durable, revisioned catalog of per-path documents with side-tagged
/// versions.
pub struct MetadataStore {
    inner: RwLock<Inner>,
    log_path: Option<PathBuf>,
}

struct Inner {
    by_id: HashMap<DocId, Document>,
    by_path: HashMap<String, DocId>,
    by_ino: HashMap<u64, DocId>,
    by_remote_id: HashMap<String, DocId>,
    /// Sequence number assigned to each committed change, in commit order.
    changes: Vec<(Seq, DocId)>,
    next_seq: Seq,
    last_files: VecDeque<Document>,
}

impl Inner {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_path: HashMap::new(),
            by_ino: HashMap::new(),
            by_remote_id: HashMap::new(),
            changes: Vec::new(),
            next_seq: 1,
            last_files: VecDeque::new(),
        }
    }

    fn index_put(&mut self, doc: Document) {
        if let Some(prior) = self.by_id.get(&doc.id) {
            if prior.path != doc.path {
                self.by_path.remove(&prior.path);
            }
            if prior.ino != doc.ino {
                if let Some(old_ino) = prior.ino {
                    self.by_ino.remove(&old_ino);
                }
            }
            let prior_remote_id = prior.remote.as_ref().map(|r| r.remote_id.clone());
            let new_remote_id = doc.remote.as_ref().map(|r| r.remote_id.clone());
            if prior_remote_id != new_remote_id {
                if let Some(old_remote_id) = prior_remote_id {
                    self.by_remote_id.remove(&old_remote_id);
                }
            }
        }

        self.by_path.insert(doc.path.clone(), doc.id.clone());
        if let Some(ino) = doc.ino {
            self.by_ino.insert(ino, doc.id.clone());
        }
        if let Some(remote) = &doc.remote {
            self.by_remote_id
                .insert(remote.remote_id.clone(), doc.id.clone());
        }

        self.last_files.retain(|d| d.id != doc.id);
        self.last_files.push_front(doc.clone());
        while self.last_files.len() > LAST_FILES_CAP {
            self.last_files.pop_back();
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.changes.push((seq, doc.id.clone()));

        self.by_id.insert(doc.id, doc);
    }

    fn index_delete(&mut self, id: &DocId) {
        if let Some(doc) = self.by_id.remove(id) {
            self.by_path.remove(&doc.path);
            if let Some(ino) = doc.ino {
                self.by_ino.remove(&ino);
            }
            if let Some(remote) = &doc.remote {
                self.by_remote_id.remove(&remote.remote_id);
            }
            self.last_files.retain(|d| d.id != *id);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.changes.push((seq, id.clone()));
    }
}

impl MetadataStore {
    /// Create a purely in-memory store with no durability. Useful for
    /// tests and for the `PassThrough`-style scenarios where the shell
    /// manages persistence itself.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
            log_path: None,
        }
    }

    /// Open (or create) a durable store whose write-ahead log lives at
    /// `log_path`, replaying any existing entries to rebuild the indexes.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Io`] if the log cannot be read, or
    /// [`MetadataError::Corrupt`] if an entry fails to deserialize.
    pub fn open(log_path: impl Into<PathBuf>) -> Result<Self, MetadataError> {
        let log_path = log_path.into();
        let mut inner = Inner::new();

        if log_path.exists() {
            let file = File::open(&log_path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LogEntry = serde_json::from_str(&line)
                    .map_err(|e| MetadataError::Corrupt(e.to_string()))?;
                match entry {
                    LogEntry::Put(doc) => inner.index_put(doc),
                    LogEntry::Delete(id) => inner.index_delete(&id),
                }
            }
            debug!(path = %log_path.display(), docs = inner.by_id.len(), "replayed metadata log");
        }

        Ok(Self {
            inner: RwLock::new(inner),
            log_path: Some(log_path),
        })
    }

    fn append_log(&self, entry: &LogEntry) -> Result<(), MetadataError> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(entry).map_err(|e| MetadataError::Corrupt(e.to_string()))?;
        writeln!(file, "{line}")?;
        file.sync_data()?;
        Ok(())
    }

    /// Look up a document by its canonical id.
    #[must_use]
    pub fn get_by_id(&self, id: &DocId) -> Option<Document> {
        self.inner.read().unwrap().by_id.get(id).cloned()
    }

    /// Look up a document by its last-observed canonical path.
    #[must_use]
    pub fn get_by_path(&self, path: &str) -> Option<Document> {
        let inner = self.inner.read().unwrap();
        inner
            .by_path
            .get(path)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Look up a document by local inode.
    #[must_use]
    pub fn get_by_ino(&self, ino: u64) -> Option<Document> {
        let inner = self.inner.read().unwrap();
        inner
            .by_ino
            .get(&ino)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Look up a document by remote identifier.
    #[must_use]
    pub fn get_by_remote_id(&self, remote_id: &str) -> Option<Document> {
        let inner = self.inner.read().unwrap();
        inner
            .by_remote_id
            .get(remote_id)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Insert or update a document, rejecting stale revisions.
    ///
    /// A document is stale if a document with the same id already exists
    /// and its `rev` is greater than or equal to the incoming `rev`
    /// (invariant: `rev` strictly increases on every write).
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::StaleRevision`] if the incoming revision
    /// does not advance the stored one, [`MetadataError::PathConflict`] if
    /// the path is claimed by a different id, or an I/O error if the
    /// write-ahead log cannot be appended.
    pub fn put(&self, doc: Document) -> Result<(), MetadataError> {
        {
            let inner = self.inner.read().unwrap();
            if let Some(existing) = inner.by_id.get(&doc.id) {
                if doc.rev <= existing.rev {
                    return Err(MetadataError::StaleRevision {
                        id: doc.id.to_string(),
                        incoming: doc.rev,
                        stored: existing.rev,
                    });
                }
            }
            if let Some(owner) = inner.by_path.get(&doc.path) {
                if *owner != doc.id {
                    return Err(MetadataError::PathConflict { path: doc.path });
                }
            }
        }

        self.append_log(&LogEntry::Put(doc.clone()))?;
        self.inner.write().unwrap().index_put(doc);
        Ok(())
    }

    /// Physically remove a document from the catalog (both sides have
    /// acknowledged the deletion).
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write-ahead log cannot be appended.
    pub fn delete(&self, id: &DocId) -> Result<(), MetadataError> {
        self.append_log(&LogEntry::Delete(id.clone()))?;
        self.inner.write().unwrap().index_delete(id);
        Ok(())
    }

    /// Return all committed changes with a sequence number greater than
    /// `since`, in commit order. The Sync Executor follows this feed to
    /// drive execution.
    #[must_use]
    pub fn changes_since(&self, since: Seq) -> Vec<(Document, Seq)> {
        let inner = self.inner.read().unwrap();
        inner
            .changes
            .iter()
            .filter(|(seq, _)| *seq > since)
            .filter_map(|(seq, id)| inner.by_id.get(id).map(|d| (d.clone(), *seq)))
            .collect()
    }

    /// Return every non-deleted document whose path is `prefix` or a
    /// descendant of it, for recursive folder operations.
    #[must_use]
    pub fn tree_under(&self, prefix: &str) -> Vec<Document> {
        let inner = self.inner.read().unwrap();
        inner
            .by_id
            .values()
            .filter(|d| !d.deleted && (d.path == prefix || d.path.starts_with(&format!("{prefix}/"))))
            .cloned()
            .collect()
    }

    /// Return every dirty (not-fully-propagated) document, for executor
    /// scheduling.
    #[must_use]
    pub fn dirty(&self) -> Vec<Document> {
        let inner = self.inner.read().unwrap();
        inner.by_id.values().filter(|d| d.is_dirty()).cloned().collect()
    }

    /// Mark `side` as caught up to the document's current revision, without
    /// advancing the revision itself. Called by the Sync Executor once it
    /// has mirrored a change onto `side`.
    ///
    /// This bypasses [`put`](Self::put)'s strictly-increasing revision
    /// check, since the document's content hasn't changed, only which
    /// sides have observed it.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Corrupt`] if `id` is not in the catalog.
    pub fn advance_side(&self, id: &DocId, side: Side) -> Result<Document, MetadataError> {
        let mut inner = self.inner.write().unwrap();
        let mut doc = inner
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| MetadataError::Corrupt(format!("advance_side: unknown id {id}")))?;
        doc.sides.set(side, doc.rev);
        doc.errors = 0;
        if doc.sides.local == doc.rev && doc.sides.remote == doc.rev {
            doc.move_from = None;
        }
        self.append_log(&LogEntry::Put(doc.clone()))?;
        inner.index_put(doc.clone());
        Ok(doc)
    }

    /// Record a failed executor attempt against `id`, incrementing its
    /// retry counter without touching its revision.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::Corrupt`] if `id` is not in the catalog.
    pub fn record_error(&self, id: &DocId) -> Result<Document, MetadataError> {
        let mut inner = self.inner.write().unwrap();
        let mut doc = inner
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| MetadataError::Corrupt(format!("record_error: unknown id {id}")))?;
        doc.errors += 1;
        self.append_log(&LogEntry::Put(doc.clone()))?;
        inner.index_put(doc.clone());
        Ok(doc)
    }

    /// Physically remove `id` if both sides have caught up to a tombstoned
    /// document's revision. Returns whether a purge happened.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write-ahead log cannot be appended.
    pub fn purge_if_fully_deleted(&self, id: &DocId) -> Result<bool, MetadataError> {
        let should_purge = {
            let inner = self.inner.read().unwrap();
            inner
                .by_id
                .get(id)
                .map(|d| d.deleted && d.sides.local == d.rev && d.sides.remote == d.rev)
                .unwrap_or(false)
        };
        if should_purge {
            self.delete(id)?;
        }
        Ok(should_purge)
    }

    /// Snapshot of the `last-files` ledger, most-recently-updated first,
    /// capped at [`LAST_FILES_CAP`] entries.
    #[must_use]
    pub fn last_files(&self) -> Vec<Document> {
        self.inner.read().unwrap().last_files.iter().cloned().collect()
    }

    /// Persist the `last-files` ledger as JSON to `path`, atomically (via
    /// write-to-temp-then-rename) so a reader never observes a partial
    /// file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the temp file cannot be written or renamed.
    pub fn persist_last_files(&self, path: &Path) -> Result<(), MetadataError> {
        let entries = self.last_files();
        let json = serde_json::to_vec_pretty(&entries).map_err(|e| MetadataError::Corrupt(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Number of documents currently indexed (including dirty ones, not
    /// counting anything removed by [`delete`](Self::delete)).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_id.len()
    }

    /// Whether the catalog currently holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
