//! Per-open-file bookkeeping: lease counting, pending-write tracking,
//! and the asynchronous error queue.
//!
//! A [`CachedFile`] moves through three states: ACTIVE (leases
//! outstanding, possibly pending writes), IDLE (zero leases, zero
//! pending writes), RECLAIMED (slot returned to the pool, object
//! dropped). ACTIVE→IDLE happens by itself as leases drop and flushes
//! complete; IDLE→RECLAIMED only ever happens through the manager's
//! removal paths — an idle file keeps serving cached reads until then.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tfs_error::WriteError;
use tfs_queue::BlockingQueue;
use tfs_types::{Inode, SlotIndex};

/// Bookkeeping object for one logical file with cache state.
///
/// The wait/notify protocol mirrors the write path: every submitted
/// write increments the pending counter, the write-back worker
/// decrements it on completion (successful or not) and wakes waiters
/// once it reaches zero.
#[derive(Debug)]
pub struct CachedFile {
    inode: Inode,
    slot: SlotIndex,
    leases: AtomicU32,
    pending: Mutex<u64>,
    writes_done: Condvar,
    errors: Arc<BlockingQueue<WriteError>>,
}

impl CachedFile {
    pub(crate) fn new(inode: Inode, slot: SlotIndex) -> Arc<Self> {
        Arc::new(Self {
            inode,
            slot,
            leases: AtomicU32::new(0),
            pending: Mutex::new(0),
            writes_done: Condvar::new(),
            errors: Arc::new(BlockingQueue::unbounded()),
        })
    }

    #[must_use]
    pub fn inode(&self) -> Inode {
        self.inode
    }

    #[must_use]
    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    /// Number of leases currently outstanding.
    #[must_use]
    pub fn lease_count(&self) -> u32 {
        self.leases.load(Ordering::Acquire)
    }

    /// Writes submitted but not yet completed by the worker.
    #[must_use]
    pub fn pending_writes(&self) -> u64 {
        *self.lock_pending()
    }

    /// Zero leases and zero pending writes.
    pub(crate) fn is_idle(&self) -> bool {
        self.lease_count() == 0 && self.pending_writes() == 0
    }

    pub(crate) fn acquire(&self) {
        self.leases.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, u64> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn write_submitted(&self) {
        *self.lock_pending() += 1;
    }

    /// Completion callback from the worker; wakes waiters at zero.
    pub(crate) fn write_completed(&self) {
        let mut pending = self.lock_pending();
        *pending = pending.saturating_sub(1);
        let done = *pending == 0;
        drop(pending);
        if done {
            self.writes_done.notify_all();
        }
    }

    /// Block until every pending write has completed.
    ///
    /// Completion does not imply success: check
    /// [`drain_errors`](Self::drain_errors) afterwards.
    pub fn wait_pending_writes(&self) {
        let mut pending = self.lock_pending();
        while *pending > 0 {
            pending = self
                .writes_done
                .wait(pending)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Like [`wait_pending_writes`](Self::wait_pending_writes), but
    /// gives up after `timeout`. Returns true if the counter reached
    /// zero.
    pub fn wait_pending_writes_timeout(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut pending = self.lock_pending();
        loop {
            if *pending == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (new_pending, timeout_result) = self
                .writes_done
                .wait_timeout(pending, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            pending = new_pending;
            if timeout_result.timed_out() {
                return *pending == 0;
            }
        }
    }

    pub(crate) fn push_error(&self, error: WriteError) {
        // The queue is unbounded and lives as long as the file; a
        // rejected push can only mean teardown already discarded it.
        let _ = self.errors.push(error);
    }

    /// Return and clear every accumulated write failure.
    #[must_use]
    pub fn drain_errors(&self) -> Vec<WriteError> {
        let mut drained = Vec::new();
        while let Some(error) = self.errors.try_pop() {
            drained.push(error);
        }
        drained
    }

    /// Handle to the error queue, for polling without consuming.
    #[must_use]
    pub fn error_queue(&self) -> Arc<BlockingQueue<WriteError>> {
        Arc::clone(&self.errors)
    }
}

/// Lease token on a [`CachedFile`].
///
/// Holding a lease keeps the file object mapped: the manager only
/// reclaims a file at zero outstanding leases. `Clone` takes another
/// lease; `Drop` releases this one.
#[derive(Debug)]
pub struct FileLease {
    file: Arc<CachedFile>,
}

impl FileLease {
    pub(crate) fn new(file: Arc<CachedFile>) -> Self {
        file.acquire();
        Self { file }
    }

    pub(crate) fn file(&self) -> &Arc<CachedFile> {
        &self.file
    }

    #[must_use]
    pub fn inode(&self) -> Inode {
        self.file.inode()
    }

    #[must_use]
    pub fn slot(&self) -> SlotIndex {
        self.file.slot()
    }

    #[must_use]
    pub fn pending_writes(&self) -> u64 {
        self.file.pending_writes()
    }

    /// See [`CachedFile::wait_pending_writes`].
    pub fn wait_pending_writes(&self) {
        self.file.wait_pending_writes();
    }

    /// See [`CachedFile::wait_pending_writes_timeout`].
    pub fn wait_pending_writes_timeout(&self, timeout: std::time::Duration) -> bool {
        self.file.wait_pending_writes_timeout(timeout)
    }

    /// See [`CachedFile::drain_errors`].
    #[must_use]
    pub fn drain_errors(&self) -> Vec<WriteError> {
        self.file.drain_errors()
    }

    /// See [`CachedFile::error_queue`].
    #[must_use]
    pub fn error_queue(&self) -> Arc<BlockingQueue<WriteError>> {
        self.file.error_queue()
    }
}

impl Clone for FileLease {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.file))
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        self.file.release();
    }
}
