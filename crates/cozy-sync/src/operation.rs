// SPDX-License-Identifier: MIT OR Apache-2.0
//! Classifies a dirty [`Document`] into the mutation the Executor must
//! mirror onto a target side.

use cozy_metadata::Document;
use cozy_path::DocType;

/// What the Executor must do to catch a target side up to a document's
/// current revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Create the folder if it doesn't already exist.
    EnsureFolder,
    /// Upload or download the file's current content.
    EnsureFile,
    /// Rename the entry from `old_path` to the document's current path.
    Move {
        /// The canonical path the entry moved from.
        old_path: String,
    },
    /// Remove the entry (trash it on the target side).
    Trash,
}

/// Determine the operation implied by `doc`'s current state.
///
/// A deleted document always means `Trash`, regardless of any in-flight
/// move. A present `move_from` with a path that actually differs from
/// the document's current path means a rename; otherwise the document is
/// treated as a plain add/update for its kind.
#[must_use]
pub fn classify(doc: &Document) -> Operation {
    if doc.deleted {
        return Operation::Trash;
    }
    if let Some(prior) = &doc.move_from {
        if prior.path != doc.path {
            return Operation::Move {
                old_path: prior.path.clone(),
            };
        }
    }
    match doc.doc_type {
        DocType::Folder => Operation::EnsureFolder,
        DocType::File => Operation::EnsureFile,
    }
}
