// SPDX-License-Identifier: MIT OR Apache-2.0
//! Remote change-feed watcher.
//!
//! Follows the remote's long-poll `changes` feed from a persisted cursor,
//! batches each page into a causally consistent order, and normalizes each
//! row into a [`cozy_merge::IncomingChange`] for the Merger.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use cozy_merge::{ChangeKind, IncomingChange};
use cozy_metadata::Side;
use cozy_protocol::{ProtocolError, RemoteChange, RemoteChangeKind, RemoteClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Starting backoff applied after a failed poll.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Backoff cap after repeated failed polls.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

fn path_depth(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}

/// Whether a change is a deletion-shaped event (must sort before any
/// sibling creation of the same name, so a trash-then-recreate overwrite
/// resolves correctly).
fn is_deletion(kind: &RemoteChangeKind) -> bool {
    matches!(kind, RemoteChangeKind::Trash | RemoteChangeKind::Delete)
}

/// Order one page of the change feed into a causally consistent sequence:
/// deletions first (so a same-named recreate in the same batch can
/// overwrite cleanly), then creates/moves/restores by ascending path depth
/// (parents before children), stable on the original feed order otherwise.
#[must_use]
pub fn batch(mut changes: Vec<RemoteChange>) -> Vec<RemoteChange> {
    let original_order: Vec<u64> = changes.iter().map(|c| c.seq).collect();
    changes.sort_by_key(|c| {
        let rank = if is_deletion(&c.kind) { 0 } else { 1 };
        let depth = c
            .entry
            .as_ref()
            .map(|e| path_depth(&e.path))
            .unwrap_or(0);
        let original_index = original_order.iter().position(|s| *s == c.seq).unwrap_or(0);
        (rank, depth, original_index)
    });
    changes
}

/// Normalize one remote change row into an [`IncomingChange`] the Merger
/// understands, or `None` if the row carries no usable entry (should not
/// happen for well-formed feeds, but the caller should not panic on it).
#[must_use]
pub fn normalize(change: &RemoteChange) -> Option<IncomingChange> {
    let kind = match &change.kind {
        RemoteChangeKind::Add => ChangeKind::Add,
        RemoteChangeKind::Update => ChangeKind::Update,
        RemoteChangeKind::Move { old_path } => ChangeKind::Move {
            old_path: old_path.clone(),
        },
        // A purge of an already-trashed entry is folded into the same
        // `Trash` change kind: the Merger physically removes a document
        // that is already marked deleted on both sides.
        RemoteChangeKind::Trash | RemoteChangeKind::Delete => ChangeKind::Trash,
        RemoteChangeKind::Restore => ChangeKind::Restore,
    };

    let entry = change.entry.as_ref()?;
    Some(IncomingChange {
        side: Side::Remote,
        path: entry.path.clone(),
        doc_type: entry.doc_type,
        kind,
        digest: entry.md5sum.clone(),
        size: entry.size,
        ino: None,
        remote_id: Some(entry.id.clone()),
    })
}

/// Drives the long-poll loop against a [`RemoteClient`], emitting
/// normalized changes on a channel and advancing its cursor only after a
/// page has been fully delivered downstream.
pub struct RemoteWatcher {
    cursor: u64,
}

impl RemoteWatcher {
    /// Start polling from `cursor`.
    #[must_use]
    pub fn new(cursor: u64) -> Self {
        Self { cursor }
    }

    /// The cursor value that will be used for the next poll.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Run the poll loop forever, sending normalized changes to `tx`.
    ///
    /// Exits only when `tx`'s receiver is dropped.
    pub async fn run(
        mut self,
        client: Arc<dyn RemoteClient>,
        tx: mpsc::UnboundedSender<IncomingChange>,
        longpoll_timeout: Duration,
    ) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match client.changes(self.cursor, longpoll_timeout).await {
                Ok(page) => {
                    backoff = INITIAL_BACKOFF;
                    let ordered = batch(page.changes);
                    let mut delivered_all = true;
                    for change in &ordered {
                        if let Some(incoming) = normalize(change) {
                            debug!(seq = change.seq, path = %incoming.path, "remote change normalized");
                            if tx.send(incoming).is_err() {
                                return;
                            }
                        } else {
                            warn!(seq = change.seq, "remote change missing entry, dropping");
                            delivered_all = false;
                        }
                    }
                    if delivered_all {
                        self.cursor = page.last_seq;
                    }
                }
                Err(err) => {
                    warn!(error = %err, cursor = self.cursor, "remote poll failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

/// Convenience wrapper distinguishing a transport failure from a logic
/// error for callers that want to branch on it (e.g. to decide whether to
/// surface `Offline` on the progress channel).
#[must_use]
pub fn is_transient(err: &ProtocolError) -> bool {
    matches!(err, ProtocolError::Transport(_))
}
