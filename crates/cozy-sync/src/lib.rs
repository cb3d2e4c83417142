// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sync core: the Executor, the per-document lock registry, and the
//! [`core::Core`] handle a shell drives the whole sync loop through.
//!
//! The Merger ([`cozy_merge`]) is the only writer of the metadata catalog;
//! this crate is the only *driver* of it, turning watcher output into
//! merges and dirty documents into mirrored filesystem/remote operations.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod core;
pub mod error;
pub mod executor;
pub mod local_side;
pub mod locks;
pub mod operation;
pub mod progress;
pub mod remote_side;
pub mod retry;

pub use core::{Core, CoreError};
pub use error::ExecError;
pub use executor::Executor;
pub use locks::PathLocks;
pub use progress::ProgressEvent;
