#![forbid(unsafe_code)]
//! Byte-budgeted block store with LRU eviction and dirty tracking.
//!
//! [`BlockStore`] owns every [`CacheEntry`]: a contiguous cached byte
//! range of one file, clean (read data, or a flushed write) or dirty
//! (a buffered write not yet durable on the remote). The store never
//! performs I/O; admission, lookup, and eviction are pure in-memory
//! bookkeeping under a single mutex, so admission and eviction are one
//! critical section and two threads cannot both believe they freed the
//! same space.
//!
//! Eviction policy:
//! - strict LRU over **clean** entries; dirty entries are never
//!   evicted (their bytes are the only copy of an unflushed write),
//! - entries touched by the same store operation share a recency
//!   stamp; among equal stamps the larger entry is evicted first so
//!   fewer evictions free the same budget.
//!
//! Dirty pressure is resolved above the store: when clean eviction
//! cannot make room for a write, [`insert_write`](BlockStore::insert_write)
//! fails and the caller decides whether to wait for write-back
//! progress ([`wait_for_space`](BlockStore::wait_for_space)) and retry.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tfs_error::{CacheError, Result};
use tfs_types::{ByteRange, Inode};
use tracing::{debug, trace};

/// One contiguous cached byte range. Owned exclusively by the store.
#[derive(Debug, Clone)]
struct CacheEntry {
    /// Payload; shared with the write-back job for dirty entries.
    data: Arc<[u8]>,
    /// True until the write-back worker reports a successful flush.
    /// Entries admitted by `insert_read` start clean and stay clean.
    dirty: bool,
    /// Admission sequence of the dirty insert this entry descends
    /// from; trimmed remainders inherit it, so a flush completion can
    /// clean every surviving piece of the range it wrote. Zero for
    /// read entries.
    seq: u64,
    /// Recency stamp for eviction ordering.
    stamp: u64,
}

impl CacheEntry {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn range(&self, offset: u64) -> ByteRange {
        ByteRange::new(offset, self.len()).expect("entry ranges are validated on admission")
    }
}

/// Eviction index key: LRU first, then larger entries first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EvictKey {
    stamp: u64,
    /// `u64::MAX - len`, so ascending order visits larger entries
    /// first among equal stamps.
    size_inv: u64,
    inode: Inode,
    offset: u64,
}

impl EvictKey {
    fn new(inode: Inode, offset: u64, entry: &CacheEntry) -> Self {
        Self {
            stamp: entry.stamp,
            size_inv: u64::MAX - entry.len(),
            inode,
            offset,
        }
    }
}

/// Bytes dropped by [`BlockStore::remove_file`].
///
/// `dirty > 0` is a data-loss signal: those bytes were accepted as
/// writes and never reached the remote. Callers must surface it, not
/// swallow it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovedBytes {
    pub total: u64,
    pub dirty: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    /// Per-file entries keyed by start offset. Entries of one file
    /// never overlap.
    files: HashMap<Inode, BTreeMap<u64, CacheEntry>>,
    /// Clean entries only, in eviction order.
    evictable: BTreeSet<EvictKey>,
    resident_bytes: u64,
    dirty_bytes: u64,
    next_stamp: u64,
    next_seq: u64,
}

impl StoreState {
    fn bump_stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    /// Entries of `inode` overlapping `range`, as (offset, range)
    /// pairs in ascending offset order.
    fn overlapping(&self, inode: Inode, range: ByteRange) -> Vec<(u64, ByteRange)> {
        let Some(entries) = self.files.get(&inode) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        // The first candidate may start before `range` and reach into it.
        let start = entries
            .range(..=range.offset())
            .next_back()
            .map_or(range.offset(), |(off, _)| *off);
        for (&off, entry) in entries.range(start..range.end()) {
            let entry_range = entry.range(off);
            if entry_range.overlaps(range) {
                out.push((off, entry_range));
            }
        }
        out
    }

    fn insert_entry(&mut self, inode: Inode, offset: u64, entry: CacheEntry) {
        self.resident_bytes += entry.len();
        if entry.dirty {
            self.dirty_bytes += entry.len();
        } else {
            self.evictable.insert(EvictKey::new(inode, offset, &entry));
        }
        self.files.entry(inode).or_default().insert(offset, entry);
    }

    /// Drop the entry at (inode, offset), fixing counters and index.
    fn remove_entry(&mut self, inode: Inode, offset: u64) -> Option<CacheEntry> {
        let entries = self.files.get_mut(&inode)?;
        let entry = entries.remove(&offset)?;
        if entries.is_empty() {
            self.files.remove(&inode);
        }
        self.resident_bytes -= entry.len();
        if entry.dirty {
            self.dirty_bytes -= entry.len();
        } else {
            self.evictable.remove(&EvictKey::new(inode, offset, &entry));
        }
        Some(entry)
    }

    /// Remove every entry overlapping `range`, reinserting the parts
    /// that lie outside it. Trimmed remainders keep their dirty flag,
    /// seq, and stamp.
    fn supersede_overlaps(&mut self, inode: Inode, range: ByteRange) {
        for (off, entry_range) in self.overlapping(inode, range) {
            let Some(entry) = self.remove_entry(inode, off) else {
                continue;
            };
            let (left, right) = entry_range.minus(range);
            for keep in [left, right].into_iter().flatten() {
                let from = (keep.offset() - off) as usize;
                let to = from + keep.len() as usize;
                let remainder = CacheEntry {
                    data: entry.data[from..to].to_vec().into(),
                    dirty: entry.dirty,
                    seq: entry.seq,
                    stamp: entry.stamp,
                };
                self.insert_entry(inode, keep.offset(), remainder);
            }
        }
    }

    /// Evict the globally least-recently-used clean entry.
    fn evict_one_clean(&mut self) -> bool {
        let Some(key) = self.evictable.first().copied() else {
            return false;
        };
        let len = self
            .remove_entry(key.inode, key.offset)
            .map_or(0, |entry| entry.len());
        debug!(inode = %key.inode, offset = key.offset, len, "evicted clean entry");
        true
    }

    fn free_bytes(&self, capacity: u64) -> u64 {
        capacity - self.resident_bytes
    }

    /// Bump the recency of the entry at (inode, offset) to `stamp`.
    fn touch(&mut self, inode: Inode, offset: u64, stamp: u64) {
        let Some(entry) = self.files.get_mut(&inode).and_then(|e| e.get_mut(&offset)) else {
            return;
        };
        if !entry.dirty {
            self.evictable.remove(&EvictKey::new(inode, offset, entry));
        }
        entry.stamp = stamp;
        if !entry.dirty {
            self.evictable.insert(EvictKey::new(inode, offset, entry));
        }
    }
}

/// The byte-budgeted entry collection the cache manager delegates
/// storage to. Resident bytes never exceed the configured capacity.
#[derive(Debug)]
pub struct BlockStore {
    capacity: u64,
    state: Mutex<StoreState>,
    space_freed: Condvar,
}

impl BlockStore {
    /// Create a store with the given byte budget.
    pub fn new(capacity_bytes: u64) -> Result<Self> {
        if capacity_bytes == 0 {
            return Err(CacheError::InvalidArgument(
                "capacity_bytes must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            capacity: capacity_bytes,
            state: Mutex::new(StoreState::default()),
            space_freed: Condvar::new(),
        })
    }

    /// Copy the contiguous resident prefix starting at `offset` into
    /// `buf`.
    ///
    /// Returns the byte count: `0` is a full miss, `buf.len()` a full
    /// hit, anything else the partial-hit prefix length after which
    /// the caller falls back to the remote for the remainder. Touches
    /// the recency of every entry read from.
    pub fn read_range(&self, inode: Inode, offset: u64, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let mut state = self.state.lock();
        let stamp = state.bump_stamp();
        let mut copied = 0_usize;
        loop {
            let Some(cursor) = offset.checked_add(copied as u64) else {
                break;
            };
            let Some((entry_off, within, take)) = ({
                state.files.get(&inode).and_then(|entries| {
                    entries.range(..=cursor).next_back().and_then(|(off, entry)| {
                        let entry_range = entry.range(*off);
                        if !entry_range.contains_offset(cursor) {
                            return None;
                        }
                        let within = (cursor - off) as usize;
                        let avail = entry.data.len() - within;
                        let take = avail.min(buf.len() - copied);
                        Some((*off, within, take))
                    })
                })
            }) else {
                break;
            };
            let entry = state
                .files
                .get(&inode)
                .and_then(|e| e.get(&entry_off))
                .expect("entry located above");
            buf[copied..copied + take].copy_from_slice(&entry.data[within..within + take]);
            state.touch(inode, entry_off, stamp);
            copied += take;
            if copied == buf.len() {
                break;
            }
        }
        copied
    }

    /// Admit freshly fetched remote data as clean entries.
    ///
    /// Never displaces dirty bytes: the admitted span is cut at the
    /// first dirty overlap (those bytes are newer than the remote
    /// copy). Clean overlaps inside the admitted span are superseded.
    /// Evicts clean LRU entries to make room; if space is still short
    /// only the prefix that fits is admitted. Returns the admitted
    /// byte count.
    pub fn insert_read(&self, inode: Inode, offset: u64, data: &[u8]) -> usize {
        let len = data.len() as u64;
        if len == 0 || offset.checked_add(len).is_none() {
            return 0;
        }
        let mut state = self.state.lock();

        // Truncate-to-budget for oversized read fills.
        let mut admit = len.min(self.capacity);
        let Some(full_range) = ByteRange::new(offset, admit) else {
            return 0;
        };

        // Stop at the first dirty overlap.
        for (off, entry_range) in state.overlapping(inode, full_range) {
            let dirty = state
                .files
                .get(&inode)
                .and_then(|e| e.get(&off))
                .is_some_and(|entry| entry.dirty);
            if dirty {
                admit = admit.min(entry_range.offset().saturating_sub(offset));
                break;
            }
        }
        if admit == 0 {
            return 0;
        }
        let range = ByteRange::new(offset, admit).expect("admit <= len, end already checked");
        state.supersede_overlaps(inode, range);

        while state.free_bytes(self.capacity) < admit {
            if !state.evict_one_clean() {
                break;
            }
        }
        let admit = admit.min(state.free_bytes(self.capacity));
        if admit == 0 {
            return 0;
        }

        let stamp = state.bump_stamp();
        let entry = CacheEntry {
            data: data[..admit as usize].to_vec().into(),
            dirty: false,
            seq: 0,
            stamp,
        };
        state.insert_entry(inode, offset, entry);
        trace!(inode = %inode, offset, admitted = admit, requested = len, "admitted read data");
        admit as usize
    }

    /// Admit a buffered write as a dirty entry, whole or not at all.
    ///
    /// Overlapping entries — clean or dirty — are superseded (newest
    /// write wins); clean LRU entries are evicted as needed. Returns
    /// the admission sequence the write-back completion will present
    /// to [`mark_clean`](Self::mark_clean).
    ///
    /// Fails with [`CacheError::CacheFull`] when the payload exceeds
    /// the whole budget, or when evicting every clean entry still
    /// cannot make room; no dirty entry is touched on failure.
    pub fn insert_write(&self, inode: Inode, offset: u64, data: Arc<[u8]>) -> Result<u64> {
        let len = data.len() as u64;
        if len == 0 || offset.checked_add(len).is_none() {
            return Err(CacheError::InvalidArgument(
                "write payload empty or range overflows".to_owned(),
            ));
        }
        if len > self.capacity {
            return Err(CacheError::CacheFull {
                needed: len,
                capacity: self.capacity,
            });
        }
        let range = ByteRange::new(offset, len).expect("end checked above");

        let mut state = self.state.lock();
        loop {
            // Superseding the overlaps will free their overlapped
            // bytes, so count them before touching anything dirty.
            let overlapped: u64 = state
                .overlapping(inode, range)
                .iter()
                .map(|(_, entry_range)| {
                    let lo = entry_range.offset().max(range.offset());
                    let hi = entry_range.end().min(range.end());
                    hi - lo
                })
                .sum();
            if state.free_bytes(self.capacity) + overlapped >= len {
                break;
            }
            if !state.evict_one_clean() {
                return Err(CacheError::CacheFull {
                    needed: len,
                    capacity: self.capacity,
                });
            }
        }

        state.supersede_overlaps(inode, range);
        debug_assert!(state.free_bytes(self.capacity) >= len);

        state.next_seq += 1;
        let seq = state.next_seq;
        let stamp = state.bump_stamp();
        let entry = CacheEntry {
            data,
            dirty: true,
            seq,
            stamp,
        };
        state.insert_entry(inode, offset, entry);
        trace!(inode = %inode, offset, len, seq, "admitted dirty write data");
        Ok(seq)
    }

    /// Flip every surviving entry of admission `seq` dirty→clean,
    /// making those bytes evictable. Called by the write-back worker
    /// after a successful flush; wakes space waiters.
    ///
    /// Returns whether any entry changed (false when the range was
    /// removed or fully superseded in the meantime — a later write owns
    /// those offsets now and carries its own seq).
    pub fn mark_clean(&self, inode: Inode, seq: u64) -> bool {
        let mut changed = false;
        {
            let mut state = self.state.lock();
            let offsets: Vec<u64> = state.files.get(&inode).map_or_else(Vec::new, |entries| {
                entries
                    .iter()
                    .filter(|(_, e)| e.dirty && e.seq == seq)
                    .map(|(off, _)| *off)
                    .collect()
            });
            for off in offsets {
                let Some(entry) = state.files.get_mut(&inode).and_then(|e| e.get_mut(&off)) else {
                    continue;
                };
                entry.dirty = false;
                let len = entry.len();
                let key = EvictKey::new(inode, off, entry);
                state.dirty_bytes -= len;
                state.evictable.insert(key);
                changed = true;
            }
        }
        if changed {
            self.space_freed.notify_all();
        }
        changed
    }

    /// Drop every surviving entry of admission `seq`, returning the
    /// byte count removed. Wakes space waiters.
    ///
    /// Used to roll back an admission whose write job was never
    /// queued; the bytes must not linger as readable cache content the
    /// remote will never receive.
    pub fn discard(&self, inode: Inode, seq: u64) -> u64 {
        if seq == 0 {
            // Read entries all carry seq 0; only write admissions are
            // individually discardable.
            return 0;
        }
        let removed = {
            let mut state = self.state.lock();
            let offsets: Vec<u64> = state.files.get(&inode).map_or_else(Vec::new, |entries| {
                entries
                    .iter()
                    .filter(|(_, e)| e.seq == seq)
                    .map(|(off, _)| *off)
                    .collect()
            });
            let mut removed = 0_u64;
            for off in offsets {
                if let Some(entry) = state.remove_entry(inode, off) {
                    removed += entry.len();
                }
            }
            removed
        };
        if removed > 0 {
            self.space_freed.notify_all();
        }
        removed
    }

    /// Drop every entry for `inode`, reporting how much of it was
    /// dirty (unflushed) data. Wakes space waiters.
    pub fn remove_file(&self, inode: Inode) -> RemovedBytes {
        let removed = {
            let mut state = self.state.lock();
            let offsets: Vec<u64> = state
                .files
                .get(&inode)
                .map_or_else(Vec::new, |entries| entries.keys().copied().collect());
            let mut removed = RemovedBytes::default();
            for off in offsets {
                if let Some(entry) = state.remove_entry(inode, off) {
                    removed.total += entry.len();
                    if entry.dirty {
                        removed.dirty += entry.len();
                    }
                }
            }
            removed
        };
        if removed.total > 0 {
            self.space_freed.notify_all();
        }
        removed
    }

    /// Whether any entry (clean or dirty) is resident for `inode`.
    #[must_use]
    pub fn has_entries(&self, inode: Inode) -> bool {
        self.state.lock().files.contains_key(&inode)
    }

    #[must_use]
    pub fn resident_bytes(&self) -> u64 {
        self.state.lock().resident_bytes
    }

    #[must_use]
    pub fn dirty_bytes(&self) -> u64 {
        self.state.lock().dirty_bytes
    }

    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    /// Park until a flush completion or removal signals that evictable
    /// space may exist, or `timeout` lapses. Returns true if signaled.
    ///
    /// Callers re-check admission in a loop; a timeout wakeup is
    /// indistinguishable from a signal on purpose.
    pub fn wait_for_space(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        !self.space_freed.wait_for(&mut state, timeout).timed_out()
    }
}
