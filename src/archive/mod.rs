//! Archive file: on-disk layout, writer, and reader.
//!
//! An archive is one file with a fixed header, a linear index array, a
//! double-decimated summary area, and a ring of major data blocks (see
//! [`header::DiskHeader`] for the exact byte layout). One process opens
//! it for writing (`fa-archiverd`'s transform engine); any number of
//! readers may open it read-only to serve historical queries from the
//! same process's socket server.

pub mod header;
pub mod index;
pub mod reader;
pub mod writer;

use crate::error::{ArchiverError, AppResult};
use header::DiskHeader;
use index::IndexEntry;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Condvar, Mutex, RwLock};

/// Shared state used by both the writer and any historical readers in
/// the same process: the (mostly immutable) header, the in-memory copy
/// of the index array, and an interlock that lets a reader wait out an
/// in-flight major-block write rather than observe a torn block.
pub struct Archive {
    header: RwLock<DiskHeader>,
    index: RwLock<Vec<IndexEntry>>,
    write_in_flight: Mutex<bool>,
    write_done: Condvar,
}

impl Archive {
    /// Open an already-prepared archive file read its header and index
    /// into memory. Does not take any lock on `file`; callers writing
    /// to the archive must additionally call
    /// [`writer::ArchiveWriter::open`], which takes the exclusive lock.
    pub fn open(path: &Path, block_alignment: u64) -> AppResult<(Self, File)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();

        let mut header_buf = vec![0u8; header::HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = DiskHeader::from_bytes(&header_buf, file_size, block_alignment)?;

        let mut index_buf = vec![0u8; header.index_data_size as usize];
        file.seek(SeekFrom::Start(header.index_data_start))?;
        file.read_exact(&mut index_buf)?;
        let index = index_buf
            .chunks_exact(index::INDEX_ENTRY_SIZE)
            .map(IndexEntry::from_bytes)
            .collect();

        Ok((
            Self {
                header: RwLock::new(header),
                index: RwLock::new(index),
                write_in_flight: Mutex::new(false),
                write_done: Condvar::new(),
            },
            file,
        ))
    }

    #[allow(clippy::unwrap_used)]
    pub fn header(&self) -> DiskHeader {
        self.header.read().unwrap().clone()
    }

    #[allow(clippy::unwrap_used)]
    pub fn index_snapshot(&self) -> Vec<IndexEntry> {
        self.index.read().unwrap().clone()
    }

    /// Block until no major-block write is in flight, then return.
    /// Called by the disk reader before every `pread` so it never
    /// observes a partially-written block. Writes take priority: a
    /// reader calling this while a write is starting simply waits.
    #[allow(clippy::unwrap_used)]
    pub fn request_read(&self) {
        let mut in_flight = self.write_in_flight.lock().unwrap();
        while *in_flight {
            in_flight = self.write_done.wait(in_flight).unwrap();
        }
    }

    #[allow(clippy::unwrap_used)]
    fn begin_write(&self) {
        *self.write_in_flight.lock().unwrap() = true;
    }

    #[allow(clippy::unwrap_used)]
    fn end_write(&self) {
        *self.write_in_flight.lock().unwrap() = false;
        self.write_done.notify_all();
    }

    #[allow(clippy::unwrap_used)]
    fn set_index_entry(&self, major_block: u32, entry: IndexEntry) {
        self.index.write().unwrap()[major_block as usize] = entry;
    }

    #[allow(clippy::unwrap_used)]
    fn set_current_major_block(&self, value: u32) {
        self.header.write().unwrap().current_major_block = value;
    }
}

/// Create a brand-new archive file: write a zeroed index and DD area,
/// then the header, then (optionally) zero the major data area. Used
/// by the `fa-prepare` CLI.
pub fn prepare(
    path: &Path,
    header: &DiskHeader,
    zero_fill_data: bool,
) -> AppResult<()> {
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
    let total = header.total_file_size();
    file.set_len(total)?;

    file.seek(SeekFrom::Start(header.index_data_start))?;
    write_zeros(&mut file, header.index_data_size)?;

    file.seek(SeekFrom::Start(header.dd_data_start))?;
    write_zeros(&mut file, header.dd_data_size)?;

    if zero_fill_data {
        file.seek(SeekFrom::Start(header.major_data_start))?;
        write_zeros(&mut file, header.major_block_count as u64 * header.major_block_size)?;
    }

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.to_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn write_zeros(file: &mut File, mut remaining: u64) -> AppResult<()> {
    const CHUNK: usize = 1 << 20;
    let zeros = vec![0u8; CHUNK];
    while remaining > 0 {
        let n = remaining.min(CHUNK as u64) as usize;
        file.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Require the file size to be a multiple of `block_size`, as `prepare`
/// must enforce per the archive's direct-IO contract.
pub fn require_block_aligned_size(file_size: u64, block_size: u64) -> AppResult<()> {
    if block_size == 0 || file_size % block_size != 0 {
        return Err(ArchiverError::Archive(format!(
            "archive file size {file_size} is not a multiple of the block size {block_size}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::header::HeaderParams;
    use crate::frame::BpmMask;
    use tempfile::tempdir;

    fn test_header() -> DiskHeader {
        let mut mask = BpmMask::empty();
        mask.set(0);
        mask.set(1);
        mask.set(2);
        DiskHeader::derive(&HeaderParams {
            archive_mask: mask,
            first_decimation: 64,
            second_decimation: 256,
            sample_frequency: 10_072.4,
            major_sample_count: 512,
            major_block_count: 4,
            block_alignment: 4096,
        })
        .unwrap()
    }

    #[test]
    fn prepare_then_open_round_trips_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.fa");
        let header = test_header();
        prepare(&path, &header, false).unwrap();

        let (archive, _file) = Archive::open(&path, 4096).unwrap();
        assert_eq!(archive.header(), header);
        assert_eq!(archive.index_snapshot().len(), header.major_block_count as usize);
    }

    #[test]
    fn request_read_does_not_block_without_a_writer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.fa");
        prepare(&path, &test_header(), false).unwrap();
        let (archive, _file) = Archive::open(&path, 4096).unwrap();
        archive.request_read();
    }
}
