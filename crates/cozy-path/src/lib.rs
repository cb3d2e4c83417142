// SPDX-License-Identifier: MIT OR Apache-2.0
//! Path canonicalization, canonical document ids, and platform naming checks.
//!
//! This is the leaf crate of the sync core: every other component depends
//! on it to agree on what a path *means* before comparing, storing, or
//! transmitting it.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of resource a document describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    /// A regular file.
    File,
    /// A directory.
    Folder,
}

/// Target platform for naming-rule enforcement.
///
/// Kept as an explicit value rather than `cfg!`-gated host detection so the
/// full incompatibility matrix is testable on any CI runner, independent of
/// the platform actually running the test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Linux (ext4 and friends): case-sensitive, byte-limit only.
    Linux,
    /// macOS (HFS+/APFS default mode): case-insensitive, case-preserving.
    MacOs,
    /// Windows (NTFS): case-insensitive, reserved names and characters.
    Windows,
}

impl Platform {
    /// Whether this platform folds case when comparing paths.
    #[must_use]
    pub fn case_sensitive(self) -> bool {
        matches!(self, Self::Linux)
    }

    /// Maximum total path length in bytes, absent any long-path opt-in.
    #[must_use]
    pub fn max_path_bytes(self) -> usize {
        match self {
            Self::Linux => 4096,
            Self::MacOs => 1024,
            Self::Windows => 260,
        }
    }

    /// Maximum bytes for a single path segment (component between `/`).
    #[must_use]
    pub fn max_segment_bytes(self) -> usize {
        255
    }

    /// Returns the platform the core is currently compiled for.
    #[must_use]
    pub fn host() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }
}

/// Windows reserved device names (case-insensitive, with or without an
/// extension).
const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Errors raised while canonicalizing a raw, possibly platform-native path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// A `..` segment tried to escape the sync root.
    #[error("path escapes root via '..': {0}")]
    EscapesRoot(String),
}

/// Canonicalize a raw, possibly platform-native path into the sync core's
/// internal forward-slash relative form.
///
/// Splits on both `/` and `\`, rejoins with `/`, trims trailing separators
/// (except for the root, which canonicalizes to the empty string), and
/// rejects `..` segments that would escape the root.
///
/// # Errors
///
/// Returns [`PathError::EscapesRoot`] if a `..` component has no preceding
/// real segment to cancel out.
pub fn canonicalize(raw: &str) -> Result<String, PathError> {
    let mut stack: Vec<&str> = Vec::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                if stack.pop().is_none() {
                    return Err(PathError::EscapesRoot(raw.to_string()));
                }
            }
            other => stack.push(other),
        }
    }
    Ok(stack.join("/"))
}

/// Stable, platform-aware primary key for a document.
///
/// Two paths that [`id`] maps to the same value are considered identity
/// conflicts (invariant 2 of the metadata catalog) and must be reconciled
/// into one document plus a conflict-renamed sibling.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(String);

impl DocId {
    /// Borrow the id's canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the canonical document id for an already-canonicalized path.
///
/// Case-folds the path on case-insensitive platforms (macOS, Windows);
/// leaves it unchanged on case-sensitive platforms (Linux).
#[must_use]
pub fn id(canonical_path: &str, platform: Platform) -> DocId {
    if platform.case_sensitive() {
        DocId(canonical_path.to_string())
    } else {
        DocId(canonical_path.to_lowercase())
    }
}

/// A single naming-rule violation found by [`check`].
///
/// Incompatibilities never block the sync; they are surfaced to the shell
/// so the user can rename on the side that accepts the offending name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Incompatibility {
    /// A segment contains a character reserved on the target platform.
    ReservedChar {
        /// The offending path segment.
        segment: String,
        /// The reserved character found.
        char: char,
    },
    /// A segment matches a name reserved on the target platform.
    ReservedName {
        /// The offending path segment.
        segment: String,
    },
    /// A segment ends in a character forbidden on the target platform.
    TrailingChar {
        /// The offending path segment.
        segment: String,
        /// The forbidden trailing character.
        char: char,
    },
    /// A segment exceeds the target platform's per-segment byte limit.
    SegmentTooLong {
        /// The offending path segment.
        segment: String,
        /// Length in bytes.
        len: usize,
        /// The platform's limit.
        limit: usize,
    },
    /// The whole path exceeds the target platform's byte limit.
    PathTooLong {
        /// Length in bytes.
        len: usize,
        /// The platform's limit.
        limit: usize,
    },
}

fn reserved_chars(platform: Platform) -> &'static [char] {
    match platform {
        Platform::Windows => &[':', '*', '?', '"', '<', '>', '|'],
        Platform::MacOs => &[':'],
        Platform::Linux => &[],
    }
}

fn is_control_char(c: char) -> bool {
    (c as u32) < 0x20
}

/// Check a canonical path for naming-rule violations on `platform`.
///
/// Returns an empty `Vec` if the path is fully compatible. Findings are
/// advisory: they describe what would break if this path were propagated
/// to `platform`, but the caller decides whether to act on them.
#[must_use]
pub fn check(path: &str, _doc_type: DocType, platform: Platform) -> Vec<Incompatibility> {
    let mut findings = Vec::new();

    if path.len() > platform.max_path_bytes() {
        findings.push(Incompatibility::PathTooLong {
            len: path.len(),
            limit: platform.max_path_bytes(),
        });
    }

    let reserved = reserved_chars(platform);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment.len() > platform.max_segment_bytes() {
            findings.push(Incompatibility::SegmentTooLong {
                segment: segment.to_string(),
                len: segment.len(),
                limit: platform.max_segment_bytes(),
            });
        }

        for c in segment.chars() {
            if reserved.contains(&c) || (platform == Platform::Windows && is_control_char(c)) {
                findings.push(Incompatibility::ReservedChar {
                    segment: segment.to_string(),
                    char: c,
                });
            }
        }

        if platform == Platform::Windows {
            let stem = segment.split('.').next().unwrap_or(segment);
            if WINDOWS_RESERVED_NAMES
                .iter()
                .any(|n| n.eq_ignore_ascii_case(stem))
            {
                findings.push(Incompatibility::ReservedName {
                    segment: segment.to_string(),
                });
            }

            if let Some(last) = segment.chars().last() {
                if last == '.' || last == ' ' {
                    findings.push(Incompatibility::TrailingChar {
                        segment: segment.to_string(),
                        char: last,
                    });
                }
            }
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_strips_separators_and_dots() {
        assert_eq!(canonicalize("a/b/c").unwrap(), "a/b/c");
        assert_eq!(canonicalize("a\\b\\c").unwrap(), "a/b/c");
        assert_eq!(canonicalize("/a/b/").unwrap(), "a/b");
        assert_eq!(canonicalize("./a/./b").unwrap(), "a/b");
        assert_eq!(canonicalize("").unwrap(), "");
    }

    #[test]
    fn canonicalize_resolves_dotdot_within_root() {
        assert_eq!(canonicalize("a/b/../c").unwrap(), "a/c");
        assert_eq!(canonicalize("a/../a/b").unwrap(), "a/b");
    }

    #[test]
    fn canonicalize_rejects_dotdot_escaping_root() {
        assert!(canonicalize("../a").is_err());
        assert!(canonicalize("a/../../b").is_err());
    }

    #[test]
    fn id_is_case_folded_on_insensitive_platforms() {
        let p = canonicalize("Foo/Bar.txt").unwrap();
        assert_eq!(id(&p, Platform::MacOs).as_str(), "foo/bar.txt");
        assert_eq!(id(&p, Platform::Windows).as_str(), "foo/bar.txt");
        assert_eq!(id(&p, Platform::Linux).as_str(), "Foo/Bar.txt");
    }

    #[test]
    fn round_trip_is_stable() {
        for raw in ["a/b/c", "/a/b/", "a\\b\\c", "a/./b/../b/c"] {
            let once = canonicalize(raw).unwrap();
            let twice = canonicalize(&once).unwrap();
            assert_eq!(once, twice, "round-trip mismatch for {raw:?}");
        }
    }

    #[test]
    fn check_flags_windows_reserved_chars() {
        let findings = check("a/b:c.txt", DocType::File, Platform::Windows);
        assert!(findings.iter().any(|f| matches!(
            f,
            Incompatibility::ReservedChar { char: ':', .. }
        )));
    }

    #[test]
    fn check_flags_windows_reserved_names() {
        let findings = check("docs/CON.txt", DocType::File, Platform::Windows);
        assert!(findings
            .iter()
            .any(|f| matches!(f, Incompatibility::ReservedName { .. })));
    }

    #[test]
    fn check_flags_trailing_dot_and_space_on_windows() {
        let findings = check("docs/name.", DocType::File, Platform::Windows);
        assert!(findings
            .iter()
            .any(|f| matches!(f, Incompatibility::TrailingChar { char: '.', .. })));

        let findings = check("docs/name ", DocType::File, Platform::Windows);
        assert!(findings
            .iter()
            .any(|f| matches!(f, Incompatibility::TrailingChar { char: ' ', .. })));
    }

    #[test]
    fn check_flags_macos_colon_only() {
        let findings = check("docs/a:b.txt", DocType::File, Platform::MacOs);
        assert!(findings.iter().any(|f| matches!(
            f,
            Incompatibility::ReservedChar { char: ':', .. }
        )));
        // Reserved names and trailing-char rules are Windows-only.
        let findings = check("docs/CON", DocType::File, Platform::MacOs);
        assert!(findings.is_empty());
    }

    #[test]
    fn check_flags_segment_and_path_length() {
        let long_segment = "a".repeat(300);
        let findings = check(&long_segment, DocType::File, Platform::Linux);
        assert!(findings
            .iter()
            .any(|f| matches!(f, Incompatibility::SegmentTooLong { .. })));

        let long_path = (0..200).map(|_| "ab").collect::<Vec<_>>().join("/");
        let findings = check(&long_path, DocType::File, Platform::Windows);
        assert!(findings
            .iter()
            .any(|f| matches!(f, Incompatibility::PathTooLong { .. })));
    }

    #[test]
    fn check_compatible_path_is_clean() {
        assert!(check("docs/report.txt", DocType::File, Platform::Linux).is_empty());
        assert!(check("docs/report.txt", DocType::File, Platform::MacOs).is_empty());
        assert!(check("docs/report.txt", DocType::File, Platform::Windows).is_empty());
    }
}
