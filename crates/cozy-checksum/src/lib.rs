// SPDX-License-Identifier: MIT OR Apache-2.0
//! Streaming content-digest service.
//!
//! Streams a local file in fixed-size chunks and produces an MD5 digest,
//! base64-encoded to match the assumed remote protocol's `Content-MD5`
//! header. A file is only digested once it has stabilized: the Sync
//! Executor must never read a half-written file into the catalog.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use base64::Engine;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Size of each read chunk while streaming a file for digesting.
const CHUNK_SIZE: usize = 64 * 1024;

/// Default number of stabilization attempts before giving up.
pub const DEFAULT_STABILIZE_ATTEMPTS: u32 = 5;

/// Default delay between stabilization attempts.
pub const DEFAULT_STABILIZE_INTERVAL: Duration = Duration::from_millis(200);

/// A base64-encoded MD5 content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Wrap an already-computed base64 digest string, e.g. one read back
    /// from the metadata catalog's `md5sum` field.
    #[must_use]
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Borrow the digest's base64 string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors raised while stabilizing or digesting a file.
#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    /// The underlying file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file's size/mtime never agreed across consecutive reads.
    #[error("file {path} did not stabilize after {attempts} attempts")]
    StillWriting {
        /// Path that failed to stabilize.
        path: String,
        /// Number of attempts made.
        attempts: u32,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> ChecksumError {
    ChecksumError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// A (size, mtime) fingerprint used to detect an in-progress write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    size: u64,
    mtime: Option<std::time::SystemTime>,
}

async fn fingerprint(path: &Path) -> Result<Fingerprint, ChecksumError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| io_err(path, e))?;
    Ok(Fingerprint {
        size: meta.len(),
        mtime: meta.modified().ok(),
    })
}

/// Wait until `path`'s size and mtime agree across two consecutive reads,
/// separated by `interval`, or fail after `max_attempts`.
///
/// This is the gate the Sync Executor applies before calling [`digest`]: a
/// file that is still being written must never be read into the catalog
/// mid-write.
///
/// # Errors
///
/// Returns [`ChecksumError::Io`] if the file cannot be stat'd, or
/// [`ChecksumError::StillWriting`] if it never stabilizes.
pub async fn stabilize(
    path: &Path,
    max_attempts: u32,
    interval: Duration,
) -> Result<(), ChecksumError> {
    let mut previous = fingerprint(path).await?;
    for attempt in 1..=max_attempts {
        tokio::time::sleep(interval).await;
        let current = fingerprint(path).await?;
        if current == previous {
            debug!(path = %path.display(), attempt, "file stabilized");
            return Ok(());
        }
        previous = current;
    }
    Err(ChecksumError::StillWriting {
        path: path.display().to_string(),
        attempts: max_attempts,
    })
}

/// Stream `path` and compute its MD5 digest, base64-encoded.
///
/// Does not itself check for stabilization; callers that care about
/// in-progress writes should call [`stabilize`] first.
///
/// # Errors
///
/// Returns [`ChecksumError::Io`] if the file cannot be opened or read.
pub async fn digest(path: &Path) -> Result<Digest, ChecksumError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| io_err(path, e))?;

    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| io_err(path, e))?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }

    let raw = ctx.compute();
    let encoded = base64::engine::general_purpose::STANDARD.encode(raw.0);
    Ok(Digest(encoded))
}
