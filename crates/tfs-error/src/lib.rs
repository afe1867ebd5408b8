#![forbid(unsafe_code)]
//! Error types for the TetherFS client cache.
//!
//! # Error Taxonomy
//!
//! The cache distinguishes two failure channels:
//!
//! | Channel | Type | Delivery |
//! |---------|------|----------|
//! | Synchronous | [`CacheError`] | Returned from the call that triggered it |
//! | Asynchronous | [`WriteError`] | Appended to the per-file error queue by the write-back worker |
//!
//! A buffered write can fail *after* the submitting call has already
//! returned; such failures are never a `CacheError` — they become
//! `WriteError` records that callers collect via the file's error
//! queue, typically before close.
//!
//! ## errno Mapping
//!
//! Every `CacheError` variant maps to exactly one POSIX errno via
//! [`CacheError::to_errno`]. The mapping is exhaustive (no wildcard
//! arm) so adding a new variant is a compile error until its errno is
//! assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS errno, else `EIO` |
//! | `InvalidArgument` | `EINVAL` |
//! | `SlotsExhausted` | `ENFILE` |
//! | `CacheFull` | `ENOSPC` |
//! | `FileNotCached` | `ENOENT` |
//! | `ShuttingDown` | `ESHUTDOWN` |

use tfs_types::Inode;
use thiserror::Error;

/// Synchronous error type for all cache operations.
///
/// Failures of writes already handed to the write-back worker are
/// reported as [`WriteError`] records on the owning file's error
/// queue, not through this type.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Operating system I/O error surfaced through a synchronous path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller-supplied argument is unusable (empty buffer, range
    /// overflow).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The slot-index pool is empty and no idle file could be
    /// reclaimed to free one.
    #[error("file slot pool exhausted ({max_files} files cached)")]
    SlotsExhausted { max_files: usize },

    /// Admission could not be satisfied within the byte budget.
    ///
    /// Raised when a write payload exceeds the total budget, or when
    /// the cache is dominated by unflushed dirty data and no flush is
    /// in flight that could ever free space.
    #[error("cache full: need {needed} bytes, capacity {capacity}")]
    CacheFull { needed: u64, capacity: u64 },

    /// No file object exists for the inode and creation was not
    /// requested.
    #[error("inode {0} has no cached file object")]
    FileNotCached(Inode),

    /// The manager has begun teardown; no new work is accepted.
    #[error("cache manager is shutting down")]
    ShuttingDown,
}

impl CacheError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::SlotsExhausted { .. } => libc::ENFILE,
            Self::CacheFull { .. } => libc::ENOSPC,
            Self::FileNotCached(_) => libc::ENOENT,
            Self::ShuttingDown => libc::ESHUTDOWN,
        }
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;

/// One failed asynchronous write, as reported on a file's error queue.
///
/// The write-back worker appends one record per failed flush and the
/// affected bytes stay dirty in the store; the record tells the caller
/// which range of its previously accepted write never became durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteError {
    /// POSIX errno of the failure.
    pub code: libc::c_int,
    /// Byte offset of the failed write.
    pub offset: u64,
    /// Length of the failed write.
    pub len: u64,
    /// Human-readable failure detail.
    pub detail: String,
}

impl WriteError {
    /// Build a record from the `io::Error` a remote write returned.
    #[must_use]
    pub fn from_io(err: &std::io::Error, offset: u64, len: u64) -> Self {
        Self {
            code: err.raw_os_error().unwrap_or(libc::EIO),
            offset,
            len,
            detail: err.to_string(),
        }
    }
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "write of {} bytes at offset {} failed (errno {}): {}",
            self.len, self.offset, self.code, self.detail
        )
    }
}
