// SPDX-License-Identifier: MIT OR Apache-2.0
//! Progress events surfaced to the shell while the executor runs.

use cozy_path::Incompatibility;
use serde::Serialize;

/// One notification point on the progress channel.
///
/// Mirrors the shell-facing event stream: a UI subscribes via
/// [`crate::core::Core::subscribe`] and renders these directly.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A transfer of `path` has begun.
    TransferStarted {
        /// The document's canonical path.
        path: String,
    },
    /// `bytes` of `path`'s content were copied to the target side.
    TransferCopy {
        /// The document's canonical path.
        path: String,
        /// Bytes copied.
        bytes: u64,
    },
    /// A document was renamed from `old` to `new` on the target side.
    TransferMove {
        /// Canonical path after the move.
        new: String,
        /// Canonical path before the move.
        old: String,
    },
    /// A document was removed from the target side.
    DeleteFile {
        /// The document's canonical path.
        path: String,
    },
    /// The catalog has no outstanding dirty documents.
    UpToDate,
    /// The remote became reachable again.
    Online,
    /// The remote stopped responding.
    Offline,
    /// One or more paths were found incompatible with a target platform.
    PlatformIncompatibilities(Vec<Incompatibility>),
    /// An unrecoverable error halted (or skipped) a document.
    SyncError(String),
}
