#![forbid(unsafe_code)]
//! Write-ahead physical block journal.
//!
//! Metadata writes are staged in borrowed buffer-cache buffers, logged
//! as whole-block images into a circular on-disk log, committed with an
//! alternating pair of header slots, and only then written to their
//! home locations asynchronously. After a crash, [`Replay`] scans the
//! committed window of the log and reinstates the newest image of every
//! block.
//!
//! The main entry points:
//!
//! - [`Journal::start`] / [`Journal::stop`] bracket a journaling
//!   session over a pair of [`rfs_block::ByteDevice`]s.
//! - [`Journal::begin`] opens a [`Txn`], through which buffers,
//!   deallocations, and live-but-unlinked inodes are registered.
//! - [`Journal::flush`] writes the pending transaction to the log and
//!   commits it.
//! - [`Replay::start`] recovers a crashed log offline;
//!   [`Replay::write_back`] applies it.

pub mod arena;
mod circ;
pub mod records;
mod replay;
mod writer;

mod journal;

pub use arena::Cookie;
pub use journal::{
    DeallocRecord, Journal, JournalConfig, JournalHooks, LogGeometry, StatsSnapshot, Txn, MAX_IO,
};
pub use replay::Replay;
