//! Archive writer: takes the whole-file exclusive lock, accepts
//! completed major blocks from the transform engine, and flushes them
//! to disk via a background writer thread with a one-slot handoff.
//!
//! Async direct I/O (POSIX AIO / `io_uring`) is the textbook way to
//! implement the ping-pong buffering in `spec.md` §4.3; a background
//! thread with a single-slot handoff is the explicitly allowed
//! alternative, and is what this crate uses so the only unsafe
//! platform code left is the `O_DIRECT` file open itself.

use super::index::IndexEntry;
use super::Archive;
use crate::error::{ArchiverError, AppResult};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

struct WriteJob {
    major_block: u32,
    offset: u64,
    data: Vec<u8>,
    /// Doubly-decimated records for this major block, if any were
    /// completed during accumulation (empty when `dd_sample_count == 0`).
    dd_offset: u64,
    dd_data: Vec<u8>,
    index_entry: IndexEntry,
}

/// Writer side of an open archive. Owns the exclusive file lock for
/// the lifetime of this value.
pub struct ArchiveWriter {
    archive: Arc<Archive>,
    major_data_start: u64,
    major_block_size: u64,
    tx: mpsc::Sender<WriteJob>,
    in_flight: Arc<(Mutex<bool>, Condvar)>,
    worker: Option<JoinHandle<()>>,
    /// Set by the background thread if a write fails; surfaced to the
    /// next `submit_major_block` call. Write errors are fatal per
    /// `spec.md` §4.3.
    failure: Arc<Mutex<Option<String>>>,
}

impl ArchiveWriter {
    /// Open `path` for writing: take the whole-file advisory exclusive
    /// lock, validate the header, and start the background flush
    /// thread.
    pub fn open(path: &Path, block_alignment: u64) -> AppResult<Self> {
        let (archive, file) = Archive::open(path, block_alignment)?;
        flock_exclusive(&file)?;
        Self::from_parts(Arc::new(archive), file)
    }

    fn from_parts(archive: Arc<Archive>, file: File) -> AppResult<Self> {
        let header = archive.header();
        let (tx, rx) = mpsc::channel::<WriteJob>();
        let in_flight = Arc::new((Mutex::new(false), Condvar::new()));
        let failure = Arc::new(Mutex::new(None));

        let worker = {
            let archive = Arc::clone(&archive);
            let in_flight = Arc::clone(&in_flight);
            let failure = Arc::clone(&failure);
            std::thread::Builder::new()
                .name("fa-archive-writer".into())
                .spawn(move || writer_loop(file, rx, archive, in_flight, failure))
                .map_err(|e| ArchiverError::Archive(format!("failed to spawn writer thread: {e}")))?
        };

        Ok(Self {
            archive,
            major_data_start: header.major_data_start,
            major_block_size: header.major_block_size,
            tx,
            in_flight,
            worker: Some(worker),
            failure,
        })
    }

    pub fn header(&self) -> super::header::DiskHeader {
        self.archive.header()
    }

    pub fn archive(&self) -> Arc<Archive> {
        Arc::clone(&self.archive)
    }

    /// Hand a completed major block to the background writer. Blocks
    /// only if the previous submission's write has not yet completed —
    /// the one-slot handoff contract. `dd_data` carries any doubly-
    /// decimated records completed while accumulating this block (empty
    /// when the header's `dd_sample_count` is zero); it is written to
    /// the block's slot in the DD area alongside the major block.
    #[allow(clippy::unwrap_used)]
    pub fn submit_major_block(
        &self,
        major_block: u32,
        data: Vec<u8>,
        dd_data: Vec<u8>,
        index_entry: IndexEntry,
    ) -> AppResult<()> {
        self.check_failure()?;
        debug_assert_eq!(data.len() as u64, self.major_block_size);

        let (lock, cond) = &*self.in_flight;
        {
            let mut in_flight = lock.lock().unwrap();
            while *in_flight {
                in_flight = cond.wait(in_flight).unwrap();
            }
            *in_flight = true;
        }

        let header = self.archive.header();
        let offset = self.major_data_start + major_block as u64 * self.major_block_size;
        let dd_offset = header.dd_data_start
            + major_block as u64 * header.archive_mask_count as u64 * header.dd_sample_count as u64 * crate::frame::DECIMATED_RECORD_SIZE as u64;
        let job = WriteJob { major_block, offset, data, dd_offset, dd_data, index_entry };
        self.tx
            .send(job)
            .map_err(|_| ArchiverError::Archive("archive writer thread has exited".into()))?;
        Ok(())
    }

    fn check_failure(&self) -> AppResult<()> {
        #[allow(clippy::unwrap_used)]
        if let Some(msg) = self.failure.lock().unwrap().clone() {
            return Err(ArchiverError::Archive(msg));
        }
        Ok(())
    }

    /// Block until the most recently submitted block has finished
    /// writing. Used at shutdown so in-flight writes complete before
    /// file descriptors close, per `spec.md` §5.
    #[allow(clippy::unwrap_used)]
    pub fn flush(&self) -> AppResult<()> {
        let (lock, cond) = &*self.in_flight;
        let mut in_flight = lock.lock().unwrap();
        while *in_flight {
            in_flight = cond.wait(in_flight).unwrap();
        }
        drop(in_flight);
        self.check_failure()
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        let _ = self.flush();
        let (replacement, _rx) = mpsc::channel::<WriteJob>();
        drop(std::mem::replace(&mut self.tx, replacement));
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn writer_loop(
    file: File,
    rx: mpsc::Receiver<WriteJob>,
    archive: Arc<Archive>,
    in_flight: Arc<(Mutex<bool>, Condvar)>,
    failure: Arc<Mutex<Option<String>>>,
) {
    while let Ok(job) = rx.recv() {
        archive.begin_write();
        let result = file.write_at(&job.data, job.offset).and_then(|_| {
            if job.dd_data.is_empty() {
                Ok(())
            } else {
                file.write_at(&job.dd_data, job.dd_offset).map(|_| ())
            }
        }).and_then(|_| file.sync_data());

        match result {
            Ok(()) => {
                archive.set_index_entry(job.major_block, job.index_entry);
                let next = (job.major_block + 1) % archive.header().major_block_count;
                archive.set_current_major_block(next);
                persist_header_and_index(&file, &archive, job.major_block).ok();
            }
            Err(e) => {
                #[allow(clippy::unwrap_used)]
                {
                    *failure.lock().unwrap() = Some(format!("major block write failed: {e}"));
                }
            }
        }
        archive.end_write();

        #[allow(clippy::unwrap_used)]
        {
            let (lock, cond) = &*in_flight;
            *lock.lock().unwrap() = false;
            cond.notify_all();
        }
    }
}

fn persist_header_and_index(file: &File, archive: &Arc<Archive>, major_block: u32) -> std::io::Result<()> {
    let header = archive.header();
    file.write_at(&header.to_bytes(), 0)?;

    let entry = archive.index_snapshot()[major_block as usize];
    let offset = header.index_data_start + major_block as u64 * super::index::INDEX_ENTRY_SIZE as u64;
    file.write_at(&entry.to_bytes(), offset)?;
    file.sync_data()
}

#[cfg(target_os = "linux")]
fn flock_exclusive(file: &File) -> AppResult<()> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;
    flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
        .map_err(|e| ArchiverError::Archive(format!("could not acquire exclusive archive lock: {e}")))
}

#[cfg(not(target_os = "linux"))]
fn flock_exclusive(_file: &File) -> AppResult<()> {
    Ok(())
}

/// Open the archive file the way the writer needs: read-write, and
/// `O_DIRECT` on Linux so major-block writes bypass the page cache
/// (the archive is assumed to live on sound, directly-addressable
/// storage per `spec.md` §4.3).
pub fn open_for_direct_io(path: &Path) -> AppResult<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    #[cfg(target_os = "linux")]
    opts.custom_flags(libc::O_DIRECT);
    opts.open(path).map_err(ArchiverError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::header::{DiskHeader, HeaderParams};
    use crate::archive::prepare;
    use crate::frame::BpmMask;
    use tempfile::tempdir;

    fn test_header() -> DiskHeader {
        let mut mask = BpmMask::empty();
        mask.set(0);
        DiskHeader::derive(&HeaderParams {
            archive_mask: mask,
            first_decimation: 4,
            second_decimation: 4,
            sample_frequency: 1000.0,
            major_sample_count: 8,
            major_block_count: 2,
            block_alignment: 4096,
        })
        .unwrap()
    }

    #[test]
    fn submit_writes_block_and_advances_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.fa");
        let header = test_header();
        prepare(&path, &header, true).unwrap();

        let writer = ArchiveWriter::open(&path, 4096).unwrap();
        let data = vec![7u8; header.major_block_size as usize];
        let entry = IndexEntry { id0: 0, timestamp_us: 1000, duration_us: 800 };
        writer.submit_major_block(0, data, Vec::new(), entry).unwrap();
        writer.flush().unwrap();

        assert_eq!(writer.archive().index_snapshot()[0], entry);
        assert_eq!(writer.header().current_major_block, 1);
    }
}
