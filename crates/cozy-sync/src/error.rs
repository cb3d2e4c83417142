// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error type produced while mirroring an operation onto a side, and its
//! mapping onto the unified [`cozy_error`] taxonomy.

use cozy_error::ErrorCode;
use cozy_path::Incompatibility;

/// Failure while applying an [`crate::operation::Operation`] to a side.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// A local filesystem operation failed.
    #[error("local I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// The remote API rejected or failed a request.
    #[error(transparent)]
    Protocol(#[from] cozy_protocol::ProtocolError),
    /// Stabilizing or digesting the source file failed.
    #[error(transparent)]
    Checksum(#[from] cozy_checksum::ChecksumError),
    /// The document's path is incompatible with the target platform.
    #[error("path incompatible with target platform: {0:?}")]
    Incompatible(Vec<Incompatibility>),
}

impl ExecError {
    /// Map this failure onto a stable [`ErrorCode`], the same taxonomy the
    /// rest of the core uses to decide retry/park/halt behavior.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            // Local I/O failures are almost always a file mid-write or
            // briefly locked by another process; the executor retries them.
            ExecError::Io(_) => ErrorCode::FileLocked,
            ExecError::Protocol(cozy_protocol::ProtocolError::Transport(_)) => {
                ErrorCode::NetworkUnavailable
            }
            ExecError::Protocol(cozy_protocol::ProtocolError::Api { status, .. }) => {
                match *status {
                    401 | 403 => ErrorCode::CredentialsRevoked,
                    413 | 507 => ErrorCode::QuotaExceeded,
                    429 => ErrorCode::Throttled,
                    _ => ErrorCode::Internal,
                }
            }
            ExecError::Protocol(cozy_protocol::ProtocolError::NotFound(_)) => {
                ErrorCode::NetworkUnavailable
            }
            ExecError::Protocol(cozy_protocol::ProtocolError::Malformed(_)) => ErrorCode::Internal,
            ExecError::Checksum(cozy_checksum::ChecksumError::StillWriting { .. }) => {
                ErrorCode::FileLocked
            }
            ExecError::Checksum(cozy_checksum::ChecksumError::Io { .. }) => ErrorCode::FileLocked,
            ExecError::Incompatible(findings) => findings
                .first()
                .map(incompatibility_code)
                .unwrap_or(ErrorCode::PathReservedChars),
        }
    }
}

fn incompatibility_code(finding: &Incompatibility) -> ErrorCode {
    match finding {
        Incompatibility::ReservedChar { .. } => ErrorCode::PathReservedChars,
        Incompatibility::ReservedName { .. } => ErrorCode::PathReservedName,
        Incompatibility::TrailingChar { .. } => ErrorCode::PathTrailingChar,
        Incompatibility::SegmentTooLong { .. } | Incompatibility::PathTooLong { .. } => {
            ErrorCode::PathTooLong
        }
    }
}
