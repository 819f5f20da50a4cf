#![forbid(unsafe_code)]
//! Error types for the RingFS journal.
//!
//! # Error Taxonomy
//!
//! The journal uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `rfs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `WalError` | `rfs-error` (this crate) | User-facing errors for filesystem and API consumers |
//!
//! ## Mapping Policy: ParseError → WalError
//!
//! `rfs-error` is intentionally independent of `rfs-types` to avoid cyclic
//! dependencies. The conversion from `ParseError` to `WalError` happens at
//! the codec boundaries in `rfs-journal`:
//!
//! | ParseError Variant | WalError Variant | Rationale |
//! |--------------------|------------------|-----------|
//! | `InsufficientData` | `Corruption { offset, detail }` | Truncated log records indicate a damaged log |
//! | `InvalidMagic` | `Format(detail)` | Wrong tag means this is not a journal header |
//! | `InvalidField` | `Format` / `InvalidGeometry` | Mount-time validation adds context from field+reason |
//! | `IntegerConversion` | `Corruption { offset, detail }` | Overflow in parsed values suggests corruption |
//!
//! During recovery (reading a live log) prefer `Corruption` with the log
//! offset so the failure can be located; during configuration validation
//! prefer `Format` or `InvalidGeometry`.
//!
//! ## Retry Semantics
//!
//! Exactly one variant is transient: [`WalError::LedgerFull`], returned when
//! the deallocation ledger hits its limit without the force flag. The caller
//! is expected to flush the journal and retry; [`WalError::is_retryable`]
//! encodes this so callers do not match on variants.
//!
//! A failed asynchronous metadata write poisons the journal: all subsequent
//! waits for log space report `Io`, and the error does not clear until the
//! journal is stopped.

use thiserror::Error;

/// Unified error type for all journal operations.
///
/// Internal errors (e.g. `ParseError` from `rfs-types`) are converted into
/// `WalError` at crate boundaries.
#[derive(Debug, Error)]
pub enum WalError {
    /// Operating system I/O error (wraps `std::io::Error`).
    ///
    /// Also reported by operations that wait on log space after an
    /// asynchronous metadata write has failed, since the log can no
    /// longer make progress.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Log record corruption detected at a known log offset.
    #[error("corrupt log record at offset {offset}: {detail}")]
    Corruption { offset: u64, detail: String },

    /// Invalid on-disk format (wrong header tag, unknown record kind,
    /// unsupported version).
    #[error("invalid log format: {0}")]
    Format(String),

    /// Journal geometry is invalid or out of the supported range.
    ///
    /// Rejected at start time: non-power-of-two block sizes, a region too
    /// small for the reserved header blocks, or a replay context whose
    /// geometry does not match the log being opened.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A configuration this build does not support.
    ///
    /// Currently: a log device block size larger than the filesystem
    /// block size.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// The log region cannot hold a maximal transaction.
    #[error("log region too small: {0} bytes")]
    TooSmall(u64),

    /// The deallocation ledger is at its limit.
    ///
    /// Transient: flush the journal and retry the registration.
    #[error("deallocation ledger full: {count} >= {limit}")]
    LedgerFull { count: usize, limit: usize },

    /// The journal cannot be stopped in its current state.
    #[error("journal busy: {0}")]
    Busy(String),

    /// Device write attempted on a read-only device.
    #[error("read-only device")]
    ReadOnly,

    /// Out-of-bounds device access.
    #[error("device access out of bounds: offset={offset} len={len} device_len={device_len}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        device_len: u64,
    },
}

impl WalError {
    /// Whether the operation may succeed if retried after a flush.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LedgerFull { .. })
    }
}

/// Result alias using `WalError`.
pub type Result<T> = std::result::Result<T, WalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = WalError::Corruption {
            offset: 3072,
            detail: "record length mismatch".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt log record at offset 3072: record length mismatch"
        );

        let full = WalError::LedgerFull {
            count: 64,
            limit: 64,
        };
        assert_eq!(full.to_string(), "deallocation ledger full: 64 >= 64");

        let geom = WalError::InvalidGeometry("fs block smaller than log block".into());
        assert!(geom.to_string().contains("invalid geometry"));

        let oob = WalError::OutOfBounds {
            offset: 4096,
            len: 512,
            device_len: 4096,
        };
        assert!(oob.to_string().contains("out of bounds"));
    }

    #[test]
    fn only_ledger_full_is_retryable() {
        assert!(WalError::LedgerFull { count: 1, limit: 1 }.is_retryable());
        assert!(!WalError::ReadOnly.is_retryable());
        assert!(!WalError::Io(std::io::Error::other("x")).is_retryable());
        assert!(!WalError::Format("x".into()).is_retryable());
        assert!(!WalError::Busy("unlinked inodes".into()).is_retryable());
    }

    #[test]
    fn io_error_converts() {
        fn inner() -> Result<()> {
            Err(std::io::Error::other("boom"))?;
            Ok(())
        }
        assert!(matches!(inner(), Err(WalError::Io(_))));
    }
}
