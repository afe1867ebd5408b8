#![forbid(unsafe_code)]
//! Client-side block cache for remote file I/O.
//!
//! [`CacheManager`] serves reads from a bounded in-memory pool of
//! previously fetched byte ranges and buffers writes for asynchronous
//! flush through a caller-supplied [`RemoteFile`] handle. A submitted
//! write is logically committed but not yet durable; callers confirm
//! durability with [`CacheManager::wait_finish_writes`] plus the
//! per-file error queue (a flush can fail after the submitting call
//! has already returned).
//!
//! The manager is an explicitly constructed, explicitly owned value:
//! build one per process with [`CacheManager::new`], share it by
//! reference, and tear it down with [`CacheManager::shutdown`] (or let
//! `Drop` do the same), which drains the write-back queue and joins
//! the worker thread.

mod file;
mod manager;
mod remote;
mod writeback;

pub use file::{CachedFile, FileLease};
pub use manager::{
    CacheConfig, CacheManager, CacheMetrics, DEFAULT_MAX_FILES, MIN_MAX_FILES, Removal,
    RemovalConstraint,
};
pub use remote::{RemoteFile, RemoteStat};
