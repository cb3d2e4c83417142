// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reconciliation engine.
//!
//! The Merger is the only component allowed to write the metadata catalog.
//! It takes one normalized change at a time and applies the reconciliation
//! table: create, update, conflict-rename, or physically remove a
//! [`Document`].
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use cozy_metadata::{Document, MetadataError, MetadataStore, Side};
use cozy_path::{DocId, DocType};
use tracing::{debug, info};

/// What kind of change a caller is feeding into [`merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// A new file or folder appeared.
    Add,
    /// An existing file's content changed.
    Update,
    /// The entry was renamed or relocated; carries the path it moved from.
    Move {
        /// The canonical path before the move.
        old_path: String,
    },
    /// The entry was moved to a trash / recycle location.
    Trash,
    /// A previously trashed entry reappeared.
    Restore,
}

/// One normalized change from either watcher, ready for reconciliation.
#[derive(Debug, Clone)]
pub struct IncomingChange {
    /// Which side produced this change.
    pub side: Side,
    /// The canonical path the change concerns (the path *after* the
    /// change, for moves).
    pub path: String,
    /// File or folder.
    pub doc_type: DocType,
    /// What happened.
    pub kind: ChangeKind,
    /// Content digest, for files; used to detect true conflicts vs.
    /// first-sync merges.
    pub digest: Option<String>,
    /// Size in bytes, for files.
    pub size: Option<u64>,
    /// Local inode, when `side` is [`Side::Local`].
    pub ino: Option<u64>,
    /// Remote identifier, when `side` is [`Side::Remote`].
    pub remote_id: Option<String>,
}

/// The result of successfully merging one [`IncomingChange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A brand-new document was created.
    Created(DocId),
    /// An existing document was updated in place.
    Updated(DocId),
    /// The incoming side's content conflicted with the existing document;
    /// the incoming side was renamed into a new sibling document.
    ConflictRenamed {
        /// The document that was left untouched.
        original: DocId,
        /// The canonical path the intruding content was renamed to.
        conflict_path: String,
    },
    /// A pre-existing remote-only (or local-only) document was found to
    /// match the incoming content exactly; both sides are now caught up.
    MergedAsIdentical(DocId),
    /// The document was deleted from both sides and purged from the
    /// catalog.
    Removed(DocId),
    /// The change required no action (content already matched).
    NoOp,
}

/// Errors raised while merging a change.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// The metadata catalog rejected the write.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// A folder-move batch touched a descendant the Executor currently has
    /// locked; the caller should back off and retry.
    #[error("path {0} is locked by the executor")]
    Locked(String),
}

/// Appends `-conflict-<ISO8601 timestamp>` before the file extension (or at
/// the end, for extensionless names and folders).
#[must_use]
pub fn conflict_path(path: &str, now: chrono::DateTime<Utc>) -> String {
    let stamp = now.format("%Y%m%dT%H%M%SZ");
    match path.rsplit_once('/') {
        Some((dir, name)) => format!("{dir}/{}", conflict_name(name, &stamp.to_string())),
        None => conflict_name(path, &stamp.to_string()),
    }
}

fn conflict_name(name: &str, stamp: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-conflict-{stamp}.{ext}"),
        _ => format!("{name}-conflict-{stamp}"),
    }
}

/// Apply one [`IncomingChange`] to `metadata`, returning the outcome.
///
/// This is the sole write path into the catalog; every other component
/// only reads it.
///
/// # Errors
///
/// Returns [`MergeError::Metadata`] if the underlying catalog write fails
/// (e.g. a concurrent path conflict).
pub fn merge(metadata: &MetadataStore, change: IncomingChange) -> Result<MergeOutcome, MergeError> {
    let canonical_id = doc_id_for_change(&change);
    let existing = metadata.get_by_path(&change.path);

    match (&change.kind, existing) {
        (ChangeKind::Add, None) => {
            let mut doc = Document::new(canonical_id, change.path.clone(), change.doc_type, change.side);
            apply_snapshot(&mut doc, &change);
            let id = doc.id.clone();
            metadata.put(doc)?;
            info!(path = %change.path, "created document from add");
            Ok(MergeOutcome::Created(id))
        }

        (ChangeKind::Add, Some(mut doc)) => {
            let other = change.side.other();
            let other_is_only_side = doc.sides.get(change.side) == 0 && doc.sides.get(other) == doc.rev;
            // Folders carry no content digest; their identity is the path
            // alone, so any first-sync folder collision is a match.
            let digest_matches =
                change.doc_type == DocType::Folder || digest_eq(&doc.md5sum, &change.digest);

            if doc.sides.get(change.side) == doc.rev && digest_matches {
                // The side that produced this change is already caught up
                // (e.g. its own upload/download echoed back through the
                // change feed): nothing to reconcile.
                return Ok(MergeOutcome::NoOp);
            }

            if other_is_only_side && digest_matches {
                doc.sides.set(change.side, doc.rev);
                apply_snapshot(&mut doc, &change);
                let id = doc.id.clone();
                metadata.put(bump(doc))?;
                info!(path = %change.path, "first-sync merge: content matched across sides");
                Ok(MergeOutcome::MergedAsIdentical(id))
            } else {
                conflict_rename(metadata, &change, &doc)
            }
        }

        (ChangeKind::Update, Some(mut doc)) => {
            if digest_eq(&doc.md5sum, &change.digest) {
                return Ok(MergeOutcome::NoOp);
            }
            let other = change.side.other();
            let other_is_dirty_differently = doc.sides.get(other) < doc.rev && !digest_eq(&doc.md5sum, &change.digest);

            if other_is_dirty_differently {
                conflict_rename(metadata, &change, &doc)
            } else {
                apply_snapshot(&mut doc, &change);
                let id = doc.id.clone();
                doc = bump(doc);
                doc.sides.set(change.side, doc.rev);
                metadata.put(doc)?;
                Ok(MergeOutcome::Updated(id))
            }
        }

        (ChangeKind::Update, None) => {
            let mut doc = Document::new(canonical_id, change.path.clone(), change.doc_type, change.side);
            apply_snapshot(&mut doc, &change);
            let id = doc.id.clone();
            metadata.put(doc)?;
            Ok(MergeOutcome::Created(id))
        }

        (ChangeKind::Move { old_path }, existing_at_new_path) => {
            let doc = existing_at_new_path
                .or_else(|| metadata.get_by_path(old_path))
                .map(|mut doc| {
                    doc.path = change.path.clone();
                    doc
                });
            match doc {
                Some(mut doc) => {
                    let prior = doc.clone();
                    apply_snapshot(&mut doc, &change);
                    let id = doc.id.clone();
                    doc = bump(doc);
                    doc.sides.set(change.side, doc.rev);
                    doc.move_from = Some(Box::new(prior));
                    metadata.put(doc)?;
                    debug!(old_path = %old_path, new_path = %change.path, "applied move");
                    Ok(MergeOutcome::Updated(id))
                }
                None => {
                    let mut new_doc =
                        Document::new(canonical_id, change.path.clone(), change.doc_type, change.side);
                    apply_snapshot(&mut new_doc, &change);
                    let id = new_doc.id.clone();
                    metadata.put(new_doc)?;
                    Ok(MergeOutcome::Created(id))
                }
            }
        }

        (ChangeKind::Trash, Some(mut doc)) => {
            if doc.deleted && doc.sides.local == doc.rev && doc.sides.remote == doc.rev {
                let id = doc.id.clone();
                metadata.delete(&id)?;
                return Ok(MergeOutcome::Removed(id));
            }
            doc.deleted = true;
            let id = doc.id.clone();
            doc = bump(doc);
            doc.sides.set(change.side, doc.rev);
            metadata.put(doc)?;
            Ok(MergeOutcome::Updated(id))
        }

        (ChangeKind::Trash, None) => Ok(MergeOutcome::NoOp),

        (ChangeKind::Restore, Some(mut doc)) => {
            doc.deleted = false;
            apply_snapshot(&mut doc, &change);
            let id = doc.id.clone();
            doc = bump(doc);
            doc.sides.set(change.side, doc.rev);
            metadata.put(doc)?;
            Ok(MergeOutcome::Updated(id))
        }

        (ChangeKind::Restore, None) => {
            let mut doc = Document::new(canonical_id, change.path.clone(), change.doc_type, change.side);
            doc.deleted = false;
            apply_snapshot(&mut doc, &change);
            let id = doc.id.clone();
            metadata.put(doc)?;
            Ok(MergeOutcome::Created(id))
        }
    }
}

/// Checked by [`apply_folder_move`] so the reconciliation engine never
/// rewrites a descendant the Sync Executor is mid-flight on.
pub trait LockCheck {
    /// Whether `id` currently has an in-flight executor operation.
    fn is_locked(&self, id: &DocId) -> bool;
}

/// Rewrite every descendant of `old_prefix` to live under `new_prefix`, as
/// one atomic batch. Rejected entirely if any descendant is locked.
///
/// # Errors
///
/// Returns [`MergeError::Locked`] if any descendant is currently locked, or
/// [`MergeError::Metadata`] if a write fails partway (the caller should
/// treat this as non-atomic and re-scan).
pub fn apply_folder_move(
    metadata: &MetadataStore,
    old_prefix: &str,
    new_prefix: &str,
    side: Side,
    locks: &dyn LockCheck,
) -> Result<Vec<DocId>, MergeError> {
    let descendants = metadata.tree_under(old_prefix);
    for doc in &descendants {
        if locks.is_locked(&doc.id) {
            return Err(MergeError::Locked(doc.path.clone()));
        }
    }

    let mut moved = Vec::with_capacity(descendants.len());
    for mut doc in descendants {
        let suffix = doc.path.strip_prefix(old_prefix).unwrap_or("");
        doc.path = format!("{new_prefix}{suffix}");
        doc = bump(doc);
        doc.sides.set(side, doc.rev);
        let id = doc.id.clone();
        metadata.put(doc)?;
        moved.push(id);
    }
    Ok(moved)
}

fn conflict_rename(
    metadata: &MetadataStore,
    change: &IncomingChange,
    existing: &Document,
) -> Result<MergeOutcome, MergeError> {
    let renamed_path = conflict_path(&change.path, Utc::now());
    let id = doc_id_for_path(&renamed_path, change.side);
    let mut conflict_doc = Document::new(id.clone(), renamed_path.clone(), change.doc_type, change.side);
    apply_snapshot(&mut conflict_doc, change);
    metadata.put(conflict_doc)?;
    info!(
        path = %change.path,
        conflict_path = %renamed_path,
        "conflict detected, intruder renamed"
    );
    Ok(MergeOutcome::ConflictRenamed {
        original: existing.id.clone(),
        conflict_path: renamed_path,
    })
}

fn apply_snapshot(doc: &mut Document, change: &IncomingChange) {
    doc.updated_at = Utc::now();
    doc.size = change.size;
    if change.doc_type == DocType::File {
        doc.md5sum = change.digest.clone();
    }
    match change.side {
        Side::Local => {
            doc.ino = change.ino;
            doc.local = Some(cozy_metadata::LocalSnapshot {
                size: change.size.unwrap_or(0),
                mtime: doc.updated_at,
                ino: change.ino,
            });
        }
        Side::Remote => {
            if let Some(remote_id) = &change.remote_id {
                doc.remote = Some(cozy_metadata::RemoteSnapshot {
                    remote_id: remote_id.clone(),
                    remote_rev: doc.rev,
                });
            }
        }
    }
}

fn bump(mut doc: Document) -> Document {
    doc.rev += 1;
    doc
}

fn digest_eq(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn doc_id_for_change(change: &IncomingChange) -> DocId {
    doc_id_for_path(&change.path, change.side)
}

fn doc_id_for_path(path: &str, side: Side) -> DocId {
    // Id derivation (case folding) is owned by `cozy-path`; the host
    // platform's rule applies regardless of which side produced the
    // change, since both sides share one catalog.
    let _ = side;
    cozy_path::id(path, cozy_path::Platform::host())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(path: &str, side: Side, digest: Option<&str>) -> IncomingChange {
        IncomingChange {
            side,
            path: path.to_string(),
            doc_type: DocType::File,
            kind: ChangeKind::Add,
            digest: digest.map(str::to_string),
            size: Some(5),
            ino: Some(1),
            remote_id: Some("r1".into()),
        }
    }

    #[test]
    fn add_with_no_existing_doc_creates_one() {
        let store = MetadataStore::in_memory();
        let outcome = merge(&store, add("a.txt", Side::Local, Some("d1"))).unwrap();
        assert!(matches!(outcome, MergeOutcome::Created(_)));
        assert!(store.get_by_path("a.txt").is_some());
    }

    #[test]
    fn matching_digest_across_sides_is_a_first_sync_merge() {
        let store = MetadataStore::in_memory();
        merge(&store, add("a.txt", Side::Remote, Some("same"))).unwrap();
        let outcome = merge(&store, add("a.txt", Side::Local, Some("same"))).unwrap();
        assert!(matches!(outcome, MergeOutcome::MergedAsIdentical(_)));
        let doc = store.get_by_path("a.txt").unwrap();
        assert!(!doc.is_dirty());
    }

    #[test]
    fn differing_digest_across_sides_is_a_conflict() {
        let store = MetadataStore::in_memory();
        merge(&store, add("a.txt", Side::Remote, Some("remote-content"))).unwrap();
        let outcome = merge(&store, add("a.txt", Side::Local, Some("local-content"))).unwrap();
        match outcome {
            MergeOutcome::ConflictRenamed { conflict_path, .. } => {
                assert!(conflict_path.contains("-conflict-"));
                assert!(store.get_by_path(&conflict_path).is_some());
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        // Original untouched.
        assert_eq!(
            store.get_by_path("a.txt").unwrap().md5sum.as_deref(),
            Some("remote-content")
        );
    }

    #[test]
    fn echoed_add_from_the_side_already_caught_up_is_a_no_op() {
        // Simulate: local creates a.txt, the executor uploads it and
        // advances sides.remote to the current rev, and *then* the remote
        // change feed echoes its own Add for the same content. This must
        // not be treated as an intruder conflicting with itself.
        let store = MetadataStore::in_memory();
        merge(&store, add("a.txt", Side::Local, Some("d1"))).unwrap();
        let mut doc = store.get_by_path("a.txt").unwrap();
        doc.sides.set(Side::Remote, doc.rev);
        store.put(doc).unwrap();

        let outcome = merge(&store, add("a.txt", Side::Remote, Some("d1"))).unwrap();
        assert_eq!(outcome, MergeOutcome::NoOp);
        assert_eq!(store.len(), 1, "the echo must not fabricate a conflict sibling");
    }

    #[test]
    fn update_with_unchanged_digest_is_a_no_op() {
        let store = MetadataStore::in_memory();
        merge(&store, add("a.txt", Side::Local, Some("d1"))).unwrap();
        let mut update = add("a.txt", Side::Local, Some("d1"));
        update.kind = ChangeKind::Update;
        let outcome = merge(&store, update).unwrap();
        assert_eq!(outcome, MergeOutcome::NoOp);
    }

    #[test]
    fn trash_sets_deleted_and_bumps_revision() {
        let store = MetadataStore::in_memory();
        merge(&store, add("a.txt", Side::Local, Some("d1"))).unwrap();
        let mut trash = add("a.txt", Side::Local, None);
        trash.kind = ChangeKind::Trash;
        merge(&store, trash).unwrap();
        let doc = store.get_by_path("a.txt").unwrap();
        assert!(doc.deleted);
    }

    #[test]
    fn move_records_prior_state_for_the_other_side_to_mirror() {
        let store = MetadataStore::in_memory();
        merge(&store, add("old.txt", Side::Local, Some("d1"))).unwrap();
        let mut mv = add("new.txt", Side::Local, Some("d1"));
        mv.kind = ChangeKind::Move { old_path: "old.txt".into() };
        merge(&store, mv).unwrap();

        let doc = store.get_by_path("new.txt").unwrap();
        let prior = doc.move_from.expect("move_from recorded");
        assert_eq!(prior.path, "old.txt");
    }

    #[test]
    fn conflict_path_inserts_before_extension() {
        let now = Utc::now();
        let renamed = conflict_path("docs/report.txt", now);
        assert!(renamed.starts_with("docs/report-conflict-"));
        assert!(renamed.ends_with(".txt"));
    }

    #[test]
    fn conflict_path_handles_extensionless_names() {
        let now = Utc::now();
        let renamed = conflict_path("README", now);
        assert!(renamed.starts_with("README-conflict-"));
    }

    struct NeverLocked;
    impl LockCheck for NeverLocked {
        fn is_locked(&self, _id: &DocId) -> bool {
            false
        }
    }

    #[test]
    fn folder_move_rewrites_all_descendants() {
        let store = MetadataStore::in_memory();
        for p in ["parent", "parent/a.txt", "parent/sub/b.txt"] {
            let doc_type = if p.ends_with(".txt") { DocType::File } else { DocType::Folder };
            let id = cozy_path::id(p, cozy_path::Platform::Linux);
            store.put(Document::new(id, p, doc_type, Side::Local)).unwrap();
        }

        let moved = apply_folder_move(&store, "parent", "renamed", Side::Local, &NeverLocked).unwrap();
        assert_eq!(moved.len(), 3);
        assert!(store.get_by_path("renamed/a.txt").is_some());
        assert!(store.get_by_path("renamed/sub/b.txt").is_some());
        assert!(store.get_by_path("parent/a.txt").is_none());
    }

    struct AlwaysLocked;
    impl LockCheck for AlwaysLocked {
        fn is_locked(&self, _id: &DocId) -> bool {
            true
        }
    }

    #[test]
    fn folder_move_rejected_when_descendant_locked() {
        let store = MetadataStore::in_memory();
        let id = cozy_path::id("parent/a.txt", cozy_path::Platform::Linux);
        store
            .put(Document::new(id, "parent/a.txt", DocType::File, Side::Local))
            .unwrap();

        let result = apply_folder_move(&store, "parent", "renamed", Side::Local, &AlwaysLocked);
        assert!(matches!(result, Err(MergeError::Locked(_))));
    }
}
