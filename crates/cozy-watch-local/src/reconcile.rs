// SPDX-License-Identifier: MIT OR Apache-2.0
//! Move reconstruction over a buffered window of raw filesystem observations.
//!
//! The OS delivers an unordered mix of create/remove/modify notifications.
//! A move therefore shows up as a `removed` at the old path and a `created`
//! at the new one, with no direct link between them. [`Window`] buffers raw
//! observations for a short, extendable period and pairs them back up.

use crate::{LocalEvent, Stat};
use cozy_checksum::Digest;
use cozy_path::Platform;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default aggregation window before a buffered window is flushed.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// Window is extended by this much every time a new observation arrives,
/// up to [`MAX_WINDOW`].
pub const EXTENSION: Duration = Duration::from_millis(250);

/// Hard cap on how long a window can be extended past [`DEFAULT_WINDOW`].
pub const MAX_WINDOW: Duration = Duration::from_secs(3);

/// The raw kind of change `notify` reported, before reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    /// A new path appeared.
    Created,
    /// A path disappeared.
    Removed,
    /// An existing file's content changed.
    Modified,
}

/// One raw observation buffered inside a [`Window`].
#[derive(Debug, Clone)]
pub struct RawObservation {
    /// Canonical relative path the observation concerns.
    pub path: String,
    /// What kind of change this was.
    pub kind: RawKind,
    /// Stat captured at observation time, if the path still existed.
    pub stat: Option<Stat>,
    /// Content digest, computed lazily only for files that might need move
    /// matching by content (rule 2).
    pub digest: Option<Digest>,
    /// Whether the path denotes a directory.
    pub is_dir: bool,
}

/// Buffers raw observations for an aggregation window and reconciles them
/// into normalized [`LocalEvent`]s on flush.
pub struct Window {
    observations: Vec<RawObservation>,
    opened_at: Instant,
    deadline: Instant,
    platform: Platform,
}

impl Window {
    /// Open a fresh, empty window.
    #[must_use]
    pub fn open(platform: Platform) -> Self {
        let now = Instant::now();
        Self {
            observations: Vec::new(),
            opened_at: now,
            deadline: now + DEFAULT_WINDOW,
            platform,
        }
    }

    /// Record a raw observation, extending the window's deadline (capped at
    /// [`MAX_WINDOW`] past the time it opened).
    pub fn observe(&mut self, obs: RawObservation) {
        self.observations.push(obs);
        let extended = Instant::now() + EXTENSION;
        let cap = self.opened_at + MAX_WINDOW;
        self.deadline = extended.min(cap);
    }

    /// Whether the window's deadline has passed and it should be flushed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Reconcile all buffered observations into normalized events and
    /// consume the window.
    #[must_use]
    pub fn flush(self) -> Vec<LocalEvent> {
        reconcile(self.observations, self.platform)
    }
}

/// Apply move-reconstruction rules 1-5 (directory-descendant suppression,
/// rule 6, is handled by the caller which knows the tree shape) to a batch
/// of raw observations, producing normalized events.
#[must_use]
pub fn reconcile(observations: Vec<RawObservation>, platform: Platform) -> Vec<LocalEvent> {
    let mut removed: Vec<RawObservation> = Vec::new();
    let mut created: Vec<RawObservation> = Vec::new();
    let mut modified: Vec<RawObservation> = Vec::new();

    for obs in observations {
        match obs.kind {
            RawKind::Removed => removed.push(obs),
            RawKind::Created => created.push(obs),
            RawKind::Modified => modified.push(obs),
        }
    }

    let mut events = Vec::new();
    let mut matched_created: Vec<bool> = vec![false; created.len()];

    for gone in &removed {
        let mut matched = false;

        // Rule 1: same inode reappearing under a new path.
        if let (Some(gone_ino), false) = (gone.stat.as_ref().and_then(|s| s.ino), matched) {
            if let Some((idx, _)) = created.iter().enumerate().find(|(i, c)| {
                !matched_created[*i] && c.stat.as_ref().and_then(|s| s.ino) == Some(gone_ino)
            }) {
                events.push(LocalEvent::Move {
                    old_path: gone.path.clone(),
                    new_path: created[idx].path.clone(),
                    stat: created[idx].stat.clone().unwrap_or_default(),
                });
                matched_created[idx] = true;
                matched = true;
            }
        }

        // Rule 2: optimistic move by identical digest + size, different inode.
        if !matched {
            if let Some(gone_digest) = &gone.digest {
                if let Some((idx, _)) = created.iter().enumerate().find(|(i, c)| {
                    !matched_created[*i]
                        && c.digest.as_ref() == Some(gone_digest)
                        && c.stat.as_ref().map(|s| s.size) == gone.stat.as_ref().map(|s| s.size)
                }) {
                    events.push(LocalEvent::Move {
                        old_path: gone.path.clone(),
                        new_path: created[idx].path.clone(),
                        stat: created[idx].stat.clone().unwrap_or_default(),
                    });
                    matched_created[idx] = true;
                    matched = true;
                }
            }
        }

        // Rule 3: case-only rename on a case-insensitive platform.
        if !matched && !platform.case_sensitive() {
            if let Some((idx, _)) = created.iter().enumerate().find(|(i, c)| {
                !matched_created[*i]
                    && c.path.eq_ignore_ascii_case(&gone.path)
                    && c.path != gone.path
            }) {
                events.push(LocalEvent::Move {
                    old_path: gone.path.clone(),
                    new_path: created[idx].path.clone(),
                    stat: created[idx].stat.clone().unwrap_or_default(),
                });
                matched_created[idx] = true;
                matched = true;
            }
        }

        // Rule 4: no match at window close is a trash.
        if !matched {
            events.push(LocalEvent::Trash {
                path: gone.path.clone(),
            });
        }
    }

    // Rule 6: suppress descendant creates that are implied by a parent move
    // already emitted above.
    let moved_prefixes: Vec<(&str, &str)> = events
        .iter()
        .filter_map(|e| match e {
            LocalEvent::Move { old_path, new_path, .. } => Some((old_path.as_str(), new_path.as_str())),
            _ => None,
        })
        .collect();

    // Rule 5: every remaining, unmatched created observation is a fresh add.
    for (idx, obs) in created.into_iter().enumerate() {
        if matched_created[idx] {
            continue;
        }
        if moved_prefixes
            .iter()
            .any(|(_, new_parent)| obs.path.starts_with(&format!("{new_parent}/")))
        {
            continue;
        }
        let stat = obs.stat.unwrap_or_default();
        if obs.is_dir {
            events.push(LocalEvent::AddDir { path: obs.path, stat });
        } else {
            events.push(LocalEvent::AddFile { path: obs.path, stat });
        }
    }

    for obs in modified {
        let stat = obs.stat.unwrap_or_default();
        events.push(LocalEvent::UpdateFile { path: obs.path, stat });
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stat(ino: u64, size: u64) -> Stat {
        Stat {
            size,
            mtime: Utc::now(),
            ino: Some(ino),
        }
    }

    fn obs(path: &str, kind: RawKind, ino: u64, size: u64) -> RawObservation {
        RawObservation {
            path: path.to_string(),
            kind,
            stat: Some(stat(ino, size)),
            digest: None,
            is_dir: false,
        }
    }

    #[test]
    fn same_inode_reappearing_is_a_move() {
        let events = reconcile(
            vec![
                obs("old.txt", RawKind::Removed, 42, 10),
                obs("new.txt", RawKind::Created, 42, 10),
            ],
            Platform::Linux,
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            LocalEvent::Move { old_path, new_path, .. }
                if old_path == "old.txt" && new_path == "new.txt"
        ));
    }

    #[test]
    fn optimistic_move_by_digest_and_size() {
        let digest = Digest::new("same-digest");
        let mut gone = obs("old.txt", RawKind::Removed, 1, 10);
        gone.digest = Some(digest.clone());
        let mut arrived = obs("new.txt", RawKind::Created, 2, 10);
        arrived.digest = Some(digest);

        let events = reconcile(vec![gone, arrived], Platform::Linux);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], LocalEvent::Move { .. }));
    }

    #[test]
    fn unmatched_removal_is_a_trash() {
        let events = reconcile(vec![obs("gone.txt", RawKind::Removed, 1, 10)], Platform::Linux);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], LocalEvent::Trash { path } if path == "gone.txt"));
    }

    #[test]
    fn unmatched_creation_is_an_add() {
        let events = reconcile(vec![obs("fresh.txt", RawKind::Created, 1, 10)], Platform::Linux);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], LocalEvent::AddFile { path, .. } if path == "fresh.txt"));
    }

    #[test]
    fn case_only_rename_is_a_move_on_case_insensitive_platform() {
        let events = reconcile(
            vec![
                obs("Report.txt", RawKind::Removed, 1, 10),
                obs("report.txt", RawKind::Created, 1, 10),
            ],
            Platform::MacOs,
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], LocalEvent::Move { .. }));
    }

    #[test]
    fn descendant_create_suppressed_when_parent_folder_moved() {
        let mut parent_gone = obs("parent", RawKind::Removed, 9, 0);
        parent_gone.is_dir = true;
        let mut parent_new = obs("renamed", RawKind::Created, 9, 0);
        parent_new.is_dir = true;
        let child_new = obs("renamed/child.txt", RawKind::Created, 55, 3);

        let events = reconcile(vec![parent_gone, parent_new, child_new], Platform::Linux);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], LocalEvent::Move { .. }));
    }
}
