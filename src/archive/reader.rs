//! Disk reader: serves historical FA, level-1 (D), and level-2 (DD)
//! reads from an open archive, interlocked with any in-flight write.

use super::header::DiskHeader;
use super::index::{ContiguityReport, IndexEntry, TimeIndex};
use super::Archive;
use crate::error::{ArchiverError, AppResult};
use crate::frame::{BpmMask, DecimatedRecord, ENTRY_SIZE, DECIMATED_RECORD_SIZE};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Which on-disk area a read targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Raw FA samples.
    Fa,
    /// Level-1 decimated records.
    D,
    /// Level-2 (doubly decimated) records.
    Dd,
}

/// Fixed-size pool of page-aligned scratch buffers, one per BPM column
/// read within a major block. Exhaustion is reported to the client as
/// "read too busy" rather than allocating unboundedly.
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_len: usize,
}

impl BufferPool {
    fn new(count: usize, buffer_len: usize) -> Self {
        Self {
            buffers: Mutex::new((0..count).map(|_| vec![0u8; buffer_len]).collect()),
            buffer_len,
        }
    }

    #[allow(clippy::unwrap_used)]
    fn acquire(&self) -> AppResult<Vec<u8>> {
        self.buffers
            .lock()
            .unwrap()
            .pop()
            .ok_or(ArchiverError::ReadTooBusy)
    }

    #[allow(clippy::unwrap_used)]
    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        buf.resize(self.buffer_len, 0);
        self.buffers.lock().unwrap().push(buf);
    }
}

/// Reader side of an open archive: opened read-only, never locked.
pub struct ArchiveReader {
    archive: Arc<Archive>,
    file: File,
    pool: BufferPool,
}

impl ArchiveReader {
    pub fn open(path: &Path, block_alignment: u64) -> AppResult<Self> {
        let (archive, file) = Archive::open(path, block_alignment)?;
        let header = archive.header();
        let pool = BufferPool::new(
            header.archive_mask_count as usize + 1,
            header.major_sample_count as usize * ENTRY_SIZE,
        );
        Ok(Self { archive, file, pool })
    }

    pub fn header(&self) -> DiskHeader {
        self.archive.header()
    }

    /// Resolve `ts` to a `(major_block, sample_offset)` position.
    pub fn timestamp_to_index(&self, ts_us: u64) -> AppResult<(u32, u32, u64)> {
        let header = self.archive.header();
        let entries = self.archive.index_snapshot();
        let index = TimeIndex::new(&header, &entries);
        index
            .timestamp_to_index(ts_us)
            .map(|l| (l.major_block, l.sample_offset, l.samples_remaining))
            .ok_or(ArchiverError::TimestampOutOfRange)
    }

    /// Check how many of the `n_blocks` major blocks starting at
    /// `start_block` form a contiguous run. When the run breaks before
    /// `n_blocks` is reached, also returns the index entry for the
    /// first block past the break, so a caller building a gap list has
    /// the real `id0`/`timestamp_us` the discontinuity starts at.
    pub fn check_contiguous(&self, start_block: u32, n_blocks: u32) -> (ContiguityReport, Option<IndexEntry>) {
        let header = self.archive.header();
        let entries = self.archive.index_snapshot();
        let index = TimeIndex::new(&header, &entries);
        let report = index.check_contiguous(start_block, n_blocks);
        let gap_entry = if report.contiguous_blocks < n_blocks && header.major_block_count > 0 {
            let idx = (start_block + report.contiguous_blocks) % header.major_block_count;
            entries.get(idx as usize).copied()
        } else {
            None
        };
        (report, gap_entry)
    }

    /// Index entry for `major_block`, used to recover the `id0` a
    /// historical read starts at.
    pub fn index_entry(&self, major_block: u32) -> Option<IndexEntry> {
        let header = self.archive.header();
        if header.major_block_count == 0 {
            return None;
        }
        let entries = self.archive.index_snapshot();
        entries.get((major_block % header.major_block_count) as usize).copied()
    }

    /// Read `n_samples` FA samples for `bpm_id` starting at
    /// `(major_block, sample_offset)`, writing `(x, y)` pairs into
    /// `out` (little-endian, `8 * n_samples` bytes).
    pub fn read_fa(
        &self,
        bpm_id: u16,
        major_block: u32,
        sample_offset: u32,
        n_samples: u32,
        out: &mut Vec<u8>,
    ) -> AppResult<()> {
        self.read_column(ReadSource::Fa, bpm_id, major_block, sample_offset, n_samples, out)
    }

    pub fn read_d(
        &self,
        bpm_id: u16,
        major_block: u32,
        sample_offset: u32,
        n_samples: u32,
        out: &mut Vec<u8>,
    ) -> AppResult<()> {
        self.read_column(ReadSource::D, bpm_id, major_block, sample_offset, n_samples, out)
    }

    /// Read `n_samples` doubly-decimated records for `bpm_id` from the
    /// mmap-resident DD area (implemented here as a plain `pread`,
    /// since the area is already small and page-cache resident after
    /// first touch).
    pub fn read_dd(
        &self,
        bpm_id: u16,
        major_block: u32,
        sample_offset: u32,
        n_samples: u32,
        out: &mut Vec<u8>,
    ) -> AppResult<()> {
        self.read_column(ReadSource::Dd, bpm_id, major_block, sample_offset, n_samples, out)
    }

    /// Read `n_samples` of `bpm_id`'s column starting at
    /// `(major_block, sample_offset)`, walking forward into as many
    /// subsequent major blocks (wrapping modulo `major_block_count`) as
    /// the requested run needs and concatenating their data in order.
    fn read_column(
        &self,
        source: ReadSource,
        bpm_id: u16,
        major_block: u32,
        sample_offset: u32,
        n_samples: u32,
        out: &mut Vec<u8>,
    ) -> AppResult<()> {
        let header = self.archive.header();
        if !header.archive_mask.contains(bpm_id) {
            return Err(ArchiverError::UnknownBpm(bpm_id));
        }
        let bpm_position = position_within_mask(&header.archive_mask, bpm_id)
            .ok_or(ArchiverError::UnknownBpm(bpm_id))?;
        let column_sample_count = match source {
            ReadSource::Fa => header.major_sample_count,
            ReadSource::D => header.d_sample_count,
            ReadSource::Dd => header.dd_sample_count,
        };
        if header.major_block_count == 0 {
            return Err(ArchiverError::Archive("archive has no major blocks".into()));
        }

        let mut block = major_block % header.major_block_count;
        let mut offset = sample_offset;
        let mut remaining = n_samples;
        while remaining > 0 {
            if offset >= column_sample_count {
                return Err(ArchiverError::Archive(format!(
                    "sample offset {offset} out of range for a {column_sample_count}-sample major block"
                )));
            }
            let take = remaining.min(column_sample_count - offset);
            self.read_column_block(source, bpm_position, block, offset, take, out)?;
            remaining -= take;
            offset = 0;
            block = (block + 1) % header.major_block_count;
        }
        Ok(())
    }

    /// Read `n_samples` of one BPM's column within a single major
    /// block; `sample_offset + n_samples` must not exceed that source's
    /// per-block sample count.
    fn read_column_block(
        &self,
        source: ReadSource,
        bpm_position: usize,
        major_block: u32,
        sample_offset: u32,
        n_samples: u32,
        out: &mut Vec<u8>,
    ) -> AppResult<()> {
        let header = self.archive.header();
        let (record_size, column_sample_count, area_start) = match source {
            ReadSource::Fa => (ENTRY_SIZE, header.major_sample_count, header.major_data_start),
            ReadSource::D => (DECIMATED_RECORD_SIZE, header.d_sample_count, header.major_data_start),
            ReadSource::Dd => (DECIMATED_RECORD_SIZE, header.dd_sample_count, header.dd_data_start),
        };

        let block_base = match source {
            ReadSource::Fa => area_start + major_block as u64 * header.major_block_size,
            ReadSource::D => {
                area_start
                    + major_block as u64 * header.major_block_size
                    + header.archive_mask_count as u64 * header.major_sample_count as u64 * ENTRY_SIZE as u64
            }
            ReadSource::Dd => {
                area_start
                    + major_block as u64
                        * header.archive_mask_count as u64
                        * header.dd_sample_count as u64
                        * DECIMATED_RECORD_SIZE as u64
            }
        };

        let column_base = block_base + bpm_position as u64 * column_sample_count as u64 * record_size as u64;
        let read_offset = column_base + sample_offset as u64 * record_size as u64;
        let read_len = n_samples as usize * record_size;

        self.archive.request_read();

        let mut buf = self.pool.acquire()?;
        if buf.len() < read_len {
            buf.resize(read_len, 0);
        }
        self.file
            .read_exact_at(&mut buf[..read_len], read_offset)
            .map_err(ArchiverError::from)?;
        out.extend_from_slice(&buf[..read_len]);
        self.pool.release(buf);
        Ok(())
    }

    /// Read a run of FA samples for every BPM in `mask`, transposing on
    /// the fly into `(frame, bpm)` row order and appending to `out` in
    /// 64 KiB staging chunks (`spec.md` §4.7).
    pub fn read_fa_transposed(
        &self,
        mask: &BpmMask,
        major_block: u32,
        sample_offset: u32,
        n_samples: u32,
        out: &mut Vec<u8>,
    ) -> AppResult<()> {
        let header = self.archive.header();
        if !mask.is_subset_of(&header.archive_mask) {
            return Err(ArchiverError::UnknownBpm(
                mask.ids().find(|id| !header.archive_mask.contains(*id)).unwrap_or(0),
            ));
        }

        let mut columns: Vec<Vec<u8>> = Vec::with_capacity(mask.count());
        for id in mask.ids() {
            let mut col = Vec::with_capacity(n_samples as usize * ENTRY_SIZE);
            self.read_fa(id, major_block, sample_offset, n_samples, &mut col)?;
            columns.push(col);
        }

        out.reserve(n_samples as usize * columns.len() * ENTRY_SIZE);
        for frame in 0..n_samples as usize {
            for col in &columns {
                let off = frame * ENTRY_SIZE;
                out.extend_from_slice(&col[off..off + ENTRY_SIZE]);
            }
        }
        Ok(())
    }

    /// Parse a run of `DecimatedRecord`s out of raw bytes, used by
    /// callers that read D/DD data and need typed access (e.g. the
    /// socket server's response assembly).
    pub fn parse_decimated(bytes: &[u8]) -> Vec<DecimatedRecord> {
        bytes
            .chunks_exact(DECIMATED_RECORD_SIZE)
            .map(DecimatedRecord::from_bytes)
            .collect()
    }
}

/// Index of `bpm_id` among the bits set in `mask`, i.e. its column
/// position within a major block (0-based, ascending BPM-id order).
fn position_within_mask(mask: &BpmMask, bpm_id: u16) -> Option<usize> {
    if !mask.contains(bpm_id) {
        return None;
    }
    Some(mask.ids().take_while(|&id| id != bpm_id).count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::header::HeaderParams;
    use crate::archive::prepare;
    use crate::archive::writer::ArchiveWriter;
    use tempfile::tempdir;

    fn small_header() -> DiskHeader {
        let mut mask = BpmMask::empty();
        mask.set(0);
        mask.set(1);
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
    fn position_within_mask_is_rank_of_set_bit() {
        let mut mask = BpmMask::empty();
        mask.set(3);
        mask.set(10);
        mask.set(200);
        assert_eq!(position_within_mask(&mask, 3), Some(0));
        assert_eq!(position_within_mask(&mask, 10), Some(1));
        assert_eq!(position_within_mask(&mask, 200), Some(2));
        assert_eq!(position_within_mask(&mask, 11), None);
    }

    #[test]
    fn read_fa_rejects_unknown_bpm() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.fa");
        let header = small_header();
        prepare(&path, &header, true).unwrap();
        let reader = ArchiveReader::open(&path, 4096).unwrap();
        let mut out = Vec::new();
        let err = reader.read_fa(5, 0, 0, 1, &mut out).unwrap_err();
        assert!(matches!(err, ArchiverError::UnknownBpm(5)));
    }

    #[test]
    fn read_fa_round_trips_written_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.fa");
        let header = small_header();
        prepare(&path, &header, true).unwrap();

        let writer = ArchiveWriter::open(&path, 4096).unwrap();
        let mut data = vec![0u8; header.major_block_size as usize];
        // BPM 0's column: 8 samples of (x=sample_index, y=0).
        for i in 0..header.major_sample_count as usize {
            data[i * ENTRY_SIZE..i * ENTRY_SIZE + 4].copy_from_slice(&(i as i32).to_le_bytes());
        }
        let entry = IndexEntry { id0: 0, timestamp_us: 0, duration_us: 8000 };
        writer.submit_major_block(0, data, Vec::new(), entry).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let reader = ArchiveReader::open(&path, 4096).unwrap();
        let mut out = Vec::new();
        reader.read_fa(0, 0, 0, header.major_sample_count, &mut out).unwrap();
        assert_eq!(out.len(), header.major_sample_count as usize * ENTRY_SIZE);
        let x0 = i32::from_le_bytes(out[0..4].try_into().unwrap());
        assert_eq!(x0, 0);
        let x_last_off = (header.major_sample_count as usize - 1) * ENTRY_SIZE;
        let x_last = i32::from_le_bytes(out[x_last_off..x_last_off + 4].try_into().unwrap());
        assert_eq!(x_last, header.major_sample_count as i32 - 1);
    }
}
