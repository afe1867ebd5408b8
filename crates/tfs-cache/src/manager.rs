//! The process-wide cache manager.
//!
//! Owns the block store, the inode→file map, the slot-index recycler,
//! and the write-back worker thread; exposes the public
//! read/write/wait/remove surface.
//!
//! Locking invariant: the map lock is always acquired before any
//! store- or file-level lock, never the reverse. Blocking calls
//! (`wait_finish_writes`, admission waits) run with the map lock
//! released, and the worker thread never takes the map lock at all —
//! jobs carry their `Arc<CachedFile>` directly.

use crate::file::{CachedFile, FileLease};
use crate::remote::RemoteFile;
use crate::writeback::{self, WriteJob};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tfs_error::{CacheError, Result, WriteError};
use tfs_queue::BlockingQueue;
use tfs_store::BlockStore;
use tfs_types::{Inode, SlotIndex};
use tracing::{debug, info, warn};

/// Default cap on concurrently cached files.
pub const DEFAULT_MAX_FILES: usize = 1000;

/// Lower bound on the configurable file cap.
pub const MIN_MAX_FILES: usize = 10;

/// How long one admission wait parks before re-checking whether
/// write-back progress is still possible.
const SPACE_WAIT_INTERVAL: Duration = Duration::from_millis(50);

/// Cache tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total byte budget of the block store. Required, > 0.
    pub capacity_bytes: u64,
    /// Maximum concurrently cached files. Default 1000, must be ≥ 10.
    pub max_files: usize,
}

impl CacheConfig {
    /// Config with the given byte budget and the default file cap.
    #[must_use]
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

/// Point-in-time observability snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub capacity_bytes: u64,
    pub resident_bytes: u64,
    pub dirty_bytes: u64,
    pub open_files: usize,
    pub queued_writes: u64,
}

/// How strict [`CacheManager::remove_file`] is about lingering state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalConstraint {
    /// Remove at zero leases, discarding any unflushed dirty data
    /// (reported, never silent).
    Weak,
    /// Remove only a fully quiescent file: zero leases, zero pending
    /// writes, zero resident entries.
    Strong,
}

/// Outcome of [`CacheManager::remove_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// No file object exists for the inode.
    NotPresent,
    /// Constraints not met; nothing changed.
    Blocked,
    /// File object removed and slot recycled. A non-zero
    /// `dirty_bytes_discarded` means unflushed writes were dropped —
    /// a data-loss condition the caller must surface.
    Removed { dirty_bytes_discarded: u64 },
}

/// The per-process cache: bounded read cache plus write-back buffer.
///
/// Construct one explicitly, share it by reference, and tear it down
/// with [`shutdown`](Self::shutdown) (or `Drop`), which drains the
/// write queue and joins the worker.
#[derive(Debug)]
pub struct CacheManager {
    config: CacheConfig,
    store: Arc<BlockStore>,
    files: RwLock<HashMap<Inode, Arc<CachedFile>>>,
    free_slots: BlockingQueue<SlotIndex>,
    jobs: Arc<BlockingQueue<WriteJob>>,
    /// Jobs submitted and not yet completed by the worker, across all
    /// files. Admission control uses it to decide whether waiting for
    /// write-back progress can ever succeed.
    outstanding: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CacheManager {
    /// Build the manager and start the write-back worker.
    pub fn new(config: CacheConfig) -> Result<Self> {
        if config.max_files < MIN_MAX_FILES {
            return Err(CacheError::InvalidArgument(format!(
                "max_files must be >= {MIN_MAX_FILES}, got {}",
                config.max_files
            )));
        }
        if u32::try_from(config.max_files).is_err() {
            return Err(CacheError::InvalidArgument(format!(
                "max_files does not fit a slot index: {}",
                config.max_files
            )));
        }
        let store = Arc::new(BlockStore::new(config.capacity_bytes)?);

        let free_slots = BlockingQueue::bounded(config.max_files);
        for index in 0..config.max_files {
            free_slots
                .push(SlotIndex(index as u32))
                .expect("slot pool is sized to hold every index");
        }

        let jobs = Arc::new(BlockingQueue::unbounded());
        let outstanding = Arc::new(AtomicU64::new(0));
        let worker = {
            let jobs = Arc::clone(&jobs);
            let store = Arc::clone(&store);
            let outstanding = Arc::clone(&outstanding);
            std::thread::spawn(move || writeback::run(&jobs, &store, &outstanding))
        };
        info!(
            capacity_bytes = config.capacity_bytes,
            max_files = config.max_files,
            "cache manager started"
        );

        Ok(Self {
            config,
            store,
            files: RwLock::new(HashMap::new()),
            free_slots,
            jobs,
            outstanding,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Buffer a write and queue its asynchronous flush.
    ///
    /// On return the data is visible to [`get_read`](Self::get_read)
    /// but not yet durable; callers confirm durability with
    /// [`wait_finish_writes`](Self::wait_finish_writes) plus the
    /// per-file error queue.
    ///
    /// Under dirty pressure the call waits for write-back progress to
    /// free budget; it fails with [`CacheError::CacheFull`] only when
    /// no queued flush could ever free enough space.
    pub fn submit_write(
        &self,
        handle: Arc<dyn RemoteFile>,
        inode: Inode,
        buf: &[u8],
        offset: u64,
    ) -> Result<()> {
        if buf.is_empty() {
            return Err(CacheError::InvalidArgument("empty write buffer".to_owned()));
        }
        if offset.checked_add(buf.len() as u64).is_none() {
            return Err(CacheError::InvalidArgument(format!(
                "write range overflows: offset={offset} len={}",
                buf.len()
            )));
        }

        let lease = self.file(inode, true)?;
        let data: Arc<[u8]> = buf.to_vec().into();

        let seq = loop {
            match self.store.insert_write(inode, offset, Arc::clone(&data)) {
                Ok(seq) => break seq,
                Err(CacheError::CacheFull { needed, capacity })
                    if self.outstanding.load(Ordering::Acquire) > 0 =>
                {
                    debug!(
                        inode = %inode,
                        needed,
                        capacity,
                        "cache full of dirty data; waiting for write-back progress"
                    );
                    self.store.wait_for_space(SPACE_WAIT_INTERVAL);
                }
                Err(err) => return Err(err),
            }
        };

        lease.file().write_submitted();
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let job = WriteJob {
            file: Arc::clone(lease.file()),
            handle,
            offset,
            data,
            seq,
        };
        if self.jobs.push(job).is_err() {
            // Teardown raced the submission; the bytes must not linger
            // as readable content the remote will never receive.
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            lease.file().write_completed();
            self.store.discard(inode, seq);
            return Err(CacheError::ShuttingDown);
        }
        Ok(())
    }

    /// Serve as much of `[offset, offset + buf.len())` as is resident.
    ///
    /// Copies the contiguous cached prefix into `buf` and returns its
    /// length (0 on a full miss). Never performs remote I/O; on an
    /// incomplete result the caller fetches the remainder itself and
    /// offers it back via [`put_read`](Self::put_read).
    pub fn get_read(&self, file: &FileLease, buf: &mut [u8], offset: u64) -> usize {
        self.store.read_range(file.inode(), offset, buf)
    }

    /// Insert freshly fetched remote data on behalf of the caller.
    ///
    /// Returns how many bytes were admitted — possibly fewer than
    /// `buf.len()` under budget pressure.
    pub fn put_read(&self, file: &FileLease, buf: &[u8], offset: u64) -> usize {
        self.store.insert_read(file.inode(), offset, buf)
    }

    /// Block until every pending write for `inode` has completed.
    ///
    /// A no-op for inodes without a file object (nothing was ever
    /// submitted). Completion does not imply success — drain the error
    /// queue to confirm.
    pub fn wait_finish_writes(&self, inode: Inode) {
        let file = self.files.read().get(&inode).cloned();
        if let Some(file) = file {
            file.wait_pending_writes();
        }
    }

    /// Lease the file object for `inode`, creating it (and consuming
    /// a slot index) when absent if `create_if_missing` is set.
    ///
    /// On an exhausted slot pool one fully quiescent idle file is
    /// reclaimed if available; otherwise the call fails fast with
    /// [`CacheError::SlotsExhausted`].
    pub fn file(&self, inode: Inode, create_if_missing: bool) -> Result<FileLease> {
        {
            let files = self.files.read();
            if let Some(file) = files.get(&inode) {
                return Ok(FileLease::new(Arc::clone(file)));
            }
        }
        if !create_if_missing {
            return Err(CacheError::FileNotCached(inode));
        }

        let mut files = self.files.write();
        if let Some(file) = files.get(&inode) {
            return Ok(FileLease::new(Arc::clone(file)));
        }
        let slot = match self.free_slots.try_pop() {
            Some(slot) => slot,
            None => self.reclaim_idle_slot(&mut files)?,
        };
        let file = CachedFile::new(inode, slot);
        files.insert(inode, Arc::clone(&file));
        debug!(inode = %inode, slot = %slot, "created file object");
        Ok(FileLease::new(file))
    }

    /// Evict one idle file's slot: zero leases, zero pending writes,
    /// zero resident entries. Called with the map write lock held.
    fn reclaim_idle_slot(
        &self,
        files: &mut HashMap<Inode, Arc<CachedFile>>,
    ) -> Result<SlotIndex> {
        let victim = files.iter().find_map(|(inode, file)| {
            (file.is_idle() && !self.store.has_entries(*inode)).then_some(*inode)
        });
        if let Some(inode) = victim {
            if let Some(file) = files.remove(&inode) {
                debug!(inode = %inode, slot = %file.slot(), "reclaimed idle file slot");
                return Ok(file.slot());
            }
        }
        Err(CacheError::SlotsExhausted {
            max_files: self.config.max_files,
        })
    }

    /// Remove the file object for `inode`, subject to `constraint`.
    ///
    /// Weak removal proceeds at zero leases even with resident or
    /// dirty data; discarded dirty bytes are reported in the result
    /// (and logged), never swallowed. Strong removal requires full
    /// quiescence. `Blocked` outcomes have no side effects.
    pub fn remove_file(&self, inode: Inode, constraint: RemovalConstraint) -> Removal {
        let mut files = self.files.write();
        let Entry::Occupied(entry) = files.entry(inode) else {
            return Removal::NotPresent;
        };
        if entry.get().lease_count() > 0 {
            return Removal::Blocked;
        }
        if matches!(constraint, RemovalConstraint::Strong)
            && (entry.get().pending_writes() > 0 || self.store.has_entries(inode))
        {
            return Removal::Blocked;
        }

        let file = entry.remove();
        let removed = self.store.remove_file(inode);
        if removed.dirty > 0 {
            warn!(
                inode = %inode,
                dirty_bytes = removed.dirty,
                "removed file with unflushed dirty data"
            );
        }
        if self.free_slots.push(file.slot()).is_err() {
            warn!(slot = %file.slot(), "slot pool rejected recycled index");
        }
        drop(files);
        Removal::Removed {
            dirty_bytes_discarded: removed.dirty,
        }
    }

    /// Per-file error queue handle, for polling without consuming.
    #[must_use]
    pub fn error_queue(&self, inode: Inode) -> Option<Arc<BlockingQueue<WriteError>>> {
        self.files.read().get(&inode).map(|file| file.error_queue())
    }

    /// Observability snapshot.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            capacity_bytes: self.store.capacity_bytes(),
            resident_bytes: self.store.resident_bytes(),
            dirty_bytes: self.store.dirty_bytes(),
            open_files: self.files.read().len(),
            queued_writes: self.outstanding.load(Ordering::Acquire),
        }
    }

    /// Drain the write-back queue and join the worker.
    ///
    /// Queued writes are still flushed (close-then-drain); only
    /// submissions arriving after this call are rejected with
    /// [`CacheError::ShuttingDown`]. Reads keep working. Idempotent,
    /// and callable through a shared reference so `Arc`-held managers
    /// can be torn down deliberately rather than by last-drop.
    pub fn shutdown(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            info!(queued = self.jobs.len(), "draining write-back queue");
            self.jobs.close();
            if worker.join().is_err() {
                warn!("write-back worker panicked during teardown");
            }
        }
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteStat;
    use std::io;
    use std::sync::Mutex;

    /// In-memory remote backed by a shared byte vector.
    struct MemRemote {
        bytes: Mutex<Vec<u8>>,
    }

    impl MemRemote {
        fn new(len: usize) -> Arc<Self> {
            Arc::new(Self {
                bytes: Mutex::new(vec![0_u8; len]),
            })
        }
    }

    impl RemoteFile for MemRemote {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            let bytes = self.bytes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let start = usize::try_from(offset).map_err(io::Error::other)?;
            if start >= bytes.len() {
                return Ok(0);
            }
            let n = buf.len().min(bytes.len() - start);
            buf[..n].copy_from_slice(&bytes[start..start + n]);
            Ok(n)
        }

        fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
            let mut bytes = self.bytes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let start = usize::try_from(offset).map_err(io::Error::other)?;
            let end = start.checked_add(buf.len()).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "write range overflow")
            })?;
            if end > bytes.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "write past end of remote file",
                ));
            }
            bytes[start..end].copy_from_slice(buf);
            Ok(buf.len())
        }

        fn stat(&self) -> io::Result<RemoteStat> {
            let bytes = self.bytes.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            Ok(RemoteStat {
                size: bytes.len() as u64,
            })
        }

        fn close(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn manager(capacity: u64, max_files: usize) -> CacheManager {
        CacheManager::new(CacheConfig {
            capacity_bytes: capacity,
            max_files,
        })
        .expect("manager")
    }

    #[test]
    fn config_validation() {
        assert!(CacheManager::new(CacheConfig::new(0)).is_err());
        assert!(
            CacheManager::new(CacheConfig {
                capacity_bytes: 4096,
                max_files: 9,
            })
            .is_err()
        );
        let config = CacheConfig::new(4096);
        assert_eq!(config.max_files, DEFAULT_MAX_FILES);
        CacheManager::new(config).expect("valid config").shutdown();
    }

    #[test]
    fn lookup_without_create_fails() {
        let manager = manager(4096, MIN_MAX_FILES);
        let err = manager.file(Inode(1), false).unwrap_err();
        assert!(matches!(err, CacheError::FileNotCached(Inode(1))));

        let lease = manager.file(Inode(1), true).expect("create");
        assert_eq!(lease.inode(), Inode(1));
        let again = manager.file(Inode(1), false).expect("existing");
        assert_eq!(again.slot(), lease.slot());
    }

    #[test]
    fn slot_recycling_over_many_lifecycles() {
        let manager = manager(1 << 20, MIN_MAX_FILES);
        // Three full passes over the pool: every create must succeed
        // because every destroy recycles its slot.
        for round in 0..3_u64 {
            for i in 0..MIN_MAX_FILES as u64 {
                let inode = Inode(round * 100 + i);
                let lease = manager.file(inode, true).expect("slot available");
                drop(lease);
                assert_eq!(
                    manager.remove_file(inode, RemovalConstraint::Weak),
                    Removal::Removed {
                        dirty_bytes_discarded: 0
                    }
                );
            }
        }
        assert_eq!(manager.metrics().open_files, 0);
    }

    #[test]
    fn slot_exhaustion_fails_fast_then_reclaims_idle() {
        let manager = manager(1 << 20, MIN_MAX_FILES);
        let mut leases: Vec<FileLease> = (0..MIN_MAX_FILES as u64)
            .map(|i| manager.file(Inode(i), true).expect("fill pool"))
            .collect();

        let err = manager.file(Inode(999), true).unwrap_err();
        assert!(matches!(err, CacheError::SlotsExhausted { .. }));

        // Dropping one lease leaves an idle, entry-free file the next
        // creation may reclaim.
        drop(leases.remove(0));
        manager.file(Inode(999), true).expect("reclaimed slot");
        drop(leases);
    }

    #[test]
    fn removal_constraint_truth_table() {
        let manager = manager(1 << 20, MIN_MAX_FILES);
        assert_eq!(
            manager.remove_file(Inode(1), RemovalConstraint::Strong),
            Removal::NotPresent
        );

        let lease = manager.file(Inode(1), true).expect("create");
        assert_eq!(
            manager.remove_file(Inode(1), RemovalConstraint::Weak),
            Removal::Blocked
        );

        // Clean resident data blocks strong removal but not weak.
        assert_eq!(manager.put_read(&lease, &[7_u8; 128], 0), 128);
        drop(lease);
        assert_eq!(
            manager.remove_file(Inode(1), RemovalConstraint::Strong),
            Removal::Blocked
        );
        assert_eq!(
            manager.remove_file(Inode(1), RemovalConstraint::Weak),
            Removal::Removed {
                dirty_bytes_discarded: 0
            }
        );
    }

    #[test]
    fn weak_removal_reports_discarded_dirty_bytes() {
        let manager = manager(1 << 20, MIN_MAX_FILES);
        let remote = MemRemote::new(4096);

        // A write whose flush is guaranteed to fail stays dirty.
        manager
            .submit_write(remote, Inode(1), &[9_u8; 256], 8192)
            .expect("submit");
        manager.wait_finish_writes(Inode(1));
        assert_eq!(manager.metrics().dirty_bytes, 256);

        assert_eq!(
            manager.remove_file(Inode(1), RemovalConstraint::Weak),
            Removal::Removed {
                dirty_bytes_discarded: 256
            }
        );
        assert_eq!(manager.metrics().dirty_bytes, 0);
    }

    #[test]
    fn strong_removal_blocked_by_resident_entries() {
        let manager = manager(1 << 20, MIN_MAX_FILES);
        let remote = MemRemote::new(4096);

        manager
            .submit_write(Arc::clone(&remote) as Arc<dyn RemoteFile>, Inode(1), &[3_u8; 64], 0)
            .expect("submit");
        manager.wait_finish_writes(Inode(1));

        // Flushed but still resident (clean): strong is blocked.
        assert_eq!(
            manager.remove_file(Inode(1), RemovalConstraint::Strong),
            Removal::Blocked
        );

        // Weak removal of the clean remainder loses nothing.
        assert_eq!(
            manager.remove_file(Inode(1), RemovalConstraint::Weak),
            Removal::Removed {
                dirty_bytes_discarded: 0
            }
        );
        assert_eq!(
            manager.remove_file(Inode(1), RemovalConstraint::Strong),
            Removal::NotPresent
        );
    }

    #[test]
    fn submit_write_validates_arguments() {
        let manager = manager(4096, MIN_MAX_FILES);
        let remote = MemRemote::new(4096);
        assert!(matches!(
            manager.submit_write(Arc::clone(&remote) as Arc<dyn RemoteFile>, Inode(1), &[], 0),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.submit_write(remote, Inode(1), &[1_u8; 4], u64::MAX - 1),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn metrics_reflect_cache_state() {
        let manager = manager(8192, MIN_MAX_FILES);
        let lease = manager.file(Inode(1), true).expect("create");
        assert_eq!(manager.put_read(&lease, &[1_u8; 1024], 0), 1024);

        let metrics = manager.metrics();
        assert_eq!(metrics.capacity_bytes, 8192);
        assert_eq!(metrics.resident_bytes, 1024);
        assert_eq!(metrics.dirty_bytes, 0);
        assert_eq!(metrics.open_files, 1);
    }
}
