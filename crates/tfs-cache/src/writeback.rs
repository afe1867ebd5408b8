//! The asynchronous write-back worker.
//!
//! A single dedicated thread drains the job queue in submission order,
//! so writes to any one file flush in the order they were submitted
//! (a side effect of there being exactly one worker; a worker pool
//! would need per-file sub-queues to keep that guarantee).
//!
//! Per job: write the payload fully through the borrowed remote
//! handle; on success mark the admitted bytes clean in the store, on
//! failure append a [`WriteError`] to the owning file's queue and
//! leave the entry dirty (no automatic retry). Either way the file's
//! pending counter is decremented last, so a caller woken by
//! `wait_finish_writes` observes the clean marking or the queued
//! error.

use crate::file::CachedFile;
use crate::remote::RemoteFile;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tfs_error::WriteError;
use tfs_queue::BlockingQueue;
use tfs_store::BlockStore;
use tracing::{info, trace, warn};

/// One buffered write awaiting flush.
///
/// The job shares its payload allocation with the store's dirty entry
/// and holds its own `Arc` on the file object, so neither a concurrent
/// removal of the file nor eviction races invalidate the flush.
pub(crate) struct WriteJob {
    pub(crate) file: Arc<CachedFile>,
    pub(crate) handle: Arc<dyn RemoteFile>,
    pub(crate) offset: u64,
    pub(crate) data: Arc<[u8]>,
    pub(crate) seq: u64,
}

impl std::fmt::Debug for WriteJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteJob")
            .field("inode", &self.file.inode())
            .field("offset", &self.offset)
            .field("len", &self.data.len())
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// Worker loop. Exits once the queue is closed and drained.
pub(crate) fn run(
    jobs: &BlockingQueue<WriteJob>,
    store: &BlockStore,
    outstanding: &AtomicU64,
) {
    info!("write-back worker started");
    while let Some(job) = jobs.pop() {
        flush_one(&job, store);
        outstanding.fetch_sub(1, Ordering::AcqRel);
        job.file.write_completed();
    }
    info!("write-back worker stopped");
}

fn flush_one(job: &WriteJob, store: &BlockStore) {
    let inode = job.file.inode();
    match write_fully(job.handle.as_ref(), job.offset, &job.data) {
        Ok(()) => {
            store.mark_clean(inode, job.seq);
            trace!(inode = %inode, offset = job.offset, len = job.data.len(), "flushed write");
        }
        Err(error) => {
            warn!(
                inode = %inode,
                offset = job.offset,
                len = job.data.len(),
                %error,
                "remote write failed; leaving entry dirty"
            );
            job.file
                .push_error(WriteError::from_io(&error, job.offset, job.data.len() as u64));
        }
    }
}

/// Write `data` at `offset`, looping over short writes.
fn write_fully(handle: &dyn RemoteFile, offset: u64, data: &[u8]) -> io::Result<()> {
    let mut written = 0_usize;
    while written < data.len() {
        let n = handle.write_at(offset + written as u64, &data[written..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "remote write accepted 0 bytes",
            ));
        }
        written += n;
    }
    Ok(())
}
