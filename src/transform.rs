//! Transform / decimation engine: the ring buffer's single reserved
//! reader. Transposes frame-major blocks into BPM-major columns,
//! computes the two decimation levels, and hands completed major
//! blocks to the [`ArchiveWriter`].

use crate::archive::index::IndexEntry;
use crate::archive::writer::ArchiveWriter;
use crate::error::AppResult;
use crate::frame::{Block, BpmMask, DecimatedRecord, Point, DECIMATED_RECORD_SIZE, ENTRY_SIZE};
use crate::ring::{ReadOutcomeOwned, ReaderId, RingBuffer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long the transform thread waits on the ring between cancellation
/// checks.
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

pub struct TransformEngine {
    ring: Arc<RingBuffer<Block>>,
    reader: ReaderId,
    writer: Arc<ArchiveWriter>,

    bpm_positions: Vec<u16>,
    first_decimation: u32,
    second_decimation: u32,
    major_sample_count: u32,
    d_sample_count: u32,
    dd_sample_count: u32,
    major_block_size: u64,
    expected_duration_us: u64,
    next_major_block: u32,
    major_block_count: u32,

    fa_columns: Vec<Vec<Point>>,
    d_columns: Vec<Vec<DecimatedRecord>>,
    dd_columns: Vec<Vec<DecimatedRecord>>,
    frames_in_major: u32,
    groups_in_major: u32,
    block_start_ts_us: u64,
    block_start_id0: u32,
}

impl TransformEngine {
    pub fn new(ring: Arc<RingBuffer<Block>>, writer: Arc<ArchiveWriter>) -> AppResult<Self> {
        let header = writer.header();
        let bpm_positions: Vec<u16> = header.archive_mask.ids().collect();
        let n = bpm_positions.len();
        let reader = ring.open_reader(true);

        let expected_duration_us =
            (header.major_sample_count as f64 / header.sample_frequency * 1_000_000.0).round() as u64;

        Ok(Self {
            ring,
            reader,
            writer,
            bpm_positions,
            first_decimation: header.first_decimation,
            second_decimation: header.second_decimation,
            major_sample_count: header.major_sample_count,
            d_sample_count: header.d_sample_count,
            dd_sample_count: header.dd_sample_count,
            major_block_size: header.major_block_size,
            expected_duration_us,
            next_major_block: header.current_major_block,
            major_block_count: header.major_block_count,
            fa_columns: vec![Vec::with_capacity(header.major_sample_count as usize); n],
            d_columns: vec![Vec::with_capacity(header.d_sample_count as usize); n],
            dd_columns: vec![Vec::with_capacity(header.dd_sample_count as usize); n],
            frames_in_major: 0,
            groups_in_major: 0,
            block_start_ts_us: 0,
            block_start_id0: 0,
        })
    }

    /// Drive the engine until `cancel` is set or the ring closes.
    pub fn run(mut self, cancel: &AtomicBool) -> AppResult<()> {
        while !cancel.load(Ordering::Relaxed) {
            match self.ring.get_read_slot_timeout(self.reader, POLL_TIMEOUT) {
                None => continue,
                Some(ReadOutcomeOwned::Data(block, ts_us, _seq)) => self.process_block(&block, ts_us)?,
                Some(ReadOutcomeOwned::Gap) => self.discard_partial(),
                Some(ReadOutcomeOwned::Underflow) => {
                    warn!("reserved reader reported underflow; this should never happen");
                }
                Some(ReadOutcomeOwned::Closed) => break,
            }
        }
        self.ring.close_reader(self.reader);
        Ok(())
    }

    fn discard_partial(&mut self) {
        if self.frames_in_major > 0 || self.groups_in_major > 0 {
            debug!(frames_discarded = self.frames_in_major, "gap: discarding partial major block");
        }
        self.reset_accumulators();
    }

    fn reset_accumulators(&mut self) {
        for col in &mut self.fa_columns {
            col.clear();
        }
        for col in &mut self.d_columns {
            col.clear();
        }
        for col in &mut self.dd_columns {
            col.clear();
        }
        self.frames_in_major = 0;
        self.groups_in_major = 0;
    }

    fn process_block(&mut self, block: &Block, ts_us: u64) -> AppResult<()> {
        for (i, frame) in block.frames.iter().enumerate() {
            if self.frames_in_major == 0 {
                self.block_start_ts_us = ts_us;
                self.block_start_id0 = block.id0.wrapping_add(i as u32);
            }

            for (col_idx, &bpm_id) in self.bpm_positions.iter().enumerate() {
                self.fa_columns[col_idx].push(frame.points[bpm_id as usize]);
            }
            self.frames_in_major += 1;

            if self.frames_in_major % self.first_decimation == 0 {
                self.emit_decimated_group();
            }
            if self.frames_in_major == self.major_sample_count {
                self.flush_major_block()?;
            }
        }
        Ok(())
    }

    fn emit_decimated_group(&mut self) {
        for col_idx in 0..self.bpm_positions.len() {
            let start = self.fa_columns[col_idx].len() - self.first_decimation as usize;
            let group = &self.fa_columns[col_idx][start..];
            self.d_columns[col_idx].push(decimate_group(group));
        }
        self.groups_in_major += 1;

        if self.dd_sample_count > 0 && self.groups_in_major % self.second_decimation == 0 {
            for col_idx in 0..self.bpm_positions.len() {
                let start = self.d_columns[col_idx].len() - self.second_decimation as usize;
                let group = &self.d_columns[col_idx][start..];
                self.dd_columns[col_idx].push(combine_decimated(group));
            }
        }
    }

    fn flush_major_block(&mut self) -> AppResult<()> {
        let mut data = vec![0u8; self.major_block_size as usize];
        let mut offset = 0usize;
        for col in &self.fa_columns {
            for point in col {
                data[offset..offset + 4].copy_from_slice(&point.x.to_le_bytes());
                data[offset + 4..offset + 8].copy_from_slice(&point.y.to_le_bytes());
                offset += ENTRY_SIZE;
            }
        }
        for col in &self.d_columns {
            for record in col {
                data[offset..offset + DECIMATED_RECORD_SIZE].copy_from_slice(&record.to_bytes());
                offset += DECIMATED_RECORD_SIZE;
            }
        }
        debug_assert_eq!(offset, data.len());

        let mut dd_data = Vec::with_capacity(
            self.bpm_positions.len() * self.dd_sample_count as usize * DECIMATED_RECORD_SIZE,
        );
        for col in &self.dd_columns {
            for record in col {
                dd_data.extend_from_slice(&record.to_bytes());
            }
        }

        let entry = IndexEntry {
            id0: self.block_start_id0,
            timestamp_us: self.block_start_ts_us,
            duration_us: self.expected_duration_us as u32,
        };

        self.writer.submit_major_block(self.next_major_block, data, dd_data, entry)?;
        self.next_major_block = (self.next_major_block + 1) % self.major_block_count;
        self.reset_accumulators();
        Ok(())
    }
}

/// Compute one [`DecimatedRecord`] from a group of consecutive points
/// using a two-pass mean/population-standard-deviation algorithm.
fn decimate_group(points: &[Point]) -> DecimatedRecord {
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|p| p.x as f64).sum();
    let sum_y: f64 = points.iter().map(|p| p.y as f64).sum();
    let mean_x = sum_x / n;
    let mean_y = sum_y / n;
    let var_x = points.iter().map(|p| (p.x as f64 - mean_x).powi(2)).sum::<f64>() / n;
    let var_y = points.iter().map(|p| (p.y as f64 - mean_y).powi(2)).sum::<f64>() / n;

    DecimatedRecord {
        mean_x: mean_x.round() as i32,
        min_x: points.iter().map(|p| p.x).min().unwrap_or(0),
        max_x: points.iter().map(|p| p.x).max().unwrap_or(0),
        std_x: var_x.sqrt().round() as i32,
        mean_y: mean_y.round() as i32,
        min_y: points.iter().map(|p| p.y).min().unwrap_or(0),
        max_y: points.iter().map(|p| p.y).max().unwrap_or(0),
        std_y: var_y.sqrt().round() as i32,
    }
}

/// Combine `second_decimation` level-1 records into one level-2 record:
/// min-of-mins, max-of-maxes, mean-of-means, `sqrt(mean(std^2))`.
fn combine_decimated(records: &[DecimatedRecord]) -> DecimatedRecord {
    let n = records.len() as f64;
    let mean_of = |f: fn(&DecimatedRecord) -> i32| records.iter().map(|r| f(r) as f64).sum::<f64>() / n;
    let rms_of = |f: fn(&DecimatedRecord) -> i32| {
        (records.iter().map(|r| (f(r) as f64).powi(2)).sum::<f64>() / n).sqrt()
    };

    DecimatedRecord {
        mean_x: mean_of(|r| r.mean_x).round() as i32,
        min_x: records.iter().map(|r| r.min_x).min().unwrap_or(0),
        max_x: records.iter().map(|r| r.max_x).max().unwrap_or(0),
        std_x: rms_of(|r| r.std_x).round() as i32,
        mean_y: mean_of(|r| r.mean_y).round() as i32,
        min_y: records.iter().map(|r| r.min_y).min().unwrap_or(0),
        max_y: records.iter().map(|r| r.max_y).max().unwrap_or(0),
        std_y: rms_of(|r| r.std_y).round() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::header::{DiskHeader, HeaderParams};
    use crate::archive::prepare;
    use crate::frame::Frame;
    use tempfile::tempdir;

    fn test_header(major_sample_count: u32, first_decimation: u32, second_decimation: u32) -> DiskHeader {
        let mut mask = BpmMask::empty();
        mask.set(0);
        mask.set(1);
        DiskHeader::derive(&HeaderParams {
            archive_mask: mask,
            first_decimation,
            second_decimation,
            sample_frequency: 10_000.0,
            major_sample_count,
            major_block_count: 2,
            block_alignment: 4096,
        })
        .unwrap()
    }

    fn block_of(n: usize, id0: u32, value: i32) -> Block {
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            let mut frame = Frame::zeroed();
            frame.points[0] = Point { x: value, y: value };
            frame.points[1] = Point { x: -value, y: -value };
            frames.push(frame);
        }
        Block { frames, id0 }
    }

    #[test]
    fn decimate_group_computes_mean_min_max() {
        let points = vec![Point { x: 1, y: 10 }, Point { x: 3, y: 20 }, Point { x: 5, y: 30 }];
        let rec = decimate_group(&points);
        assert_eq!(rec.mean_x, 3);
        assert_eq!(rec.min_x, 1);
        assert_eq!(rec.max_x, 5);
        assert_eq!(rec.mean_y, 20);
    }

    #[test]
    fn combine_decimated_takes_min_of_mins_and_max_of_maxes() {
        let a = DecimatedRecord { mean_x: 0, min_x: -5, max_x: 5, std_x: 1, mean_y: 0, min_y: -5, max_y: 5, std_y: 1 };
        let b = DecimatedRecord { mean_x: 10, min_x: -1, max_x: 20, std_x: 2, mean_y: 10, min_y: -1, max_y: 20, std_y: 2 };
        let combined = combine_decimated(&[a, b]);
        assert_eq!(combined.min_x, -5);
        assert_eq!(combined.max_x, 20);
        assert_eq!(combined.mean_x, 5);
    }

    #[test]
    fn flush_writes_one_major_block_and_advances_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.fa");
        let header = test_header(8, 4, 2);
        prepare(&path, &header, true).unwrap();

        let ring = RingBuffer::<Block>::new(4);
        let writer = Arc::new(ArchiveWriter::open(&path, 4096).unwrap());
        let mut engine = TransformEngine::new(Arc::clone(&ring), Arc::clone(&writer)).unwrap();

        engine.process_block(&block_of(8, 0, 42), 1_000_000).unwrap();
        writer.flush().unwrap();

        assert_eq!(writer.header().current_major_block, 1);
        let entry = writer.archive().index_snapshot()[0];
        assert_eq!(entry.id0, 0);
        assert_eq!(entry.timestamp_us, 1_000_000);
    }

    #[test]
    fn gap_discards_partial_accumulation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.fa");
        let header = test_header(8, 4, 2);
        prepare(&path, &header, true).unwrap();

        let ring = RingBuffer::<Block>::new(4);
        let writer = Arc::new(ArchiveWriter::open(&path, 4096).unwrap());
        let mut engine = TransformEngine::new(Arc::clone(&ring), writer).unwrap();

        engine.process_block(&block_of(4, 0, 1), 0).unwrap();
        assert_eq!(engine.frames_in_major, 4);
        engine.discard_partial();
        assert_eq!(engine.frames_in_major, 0);
        assert!(engine.fa_columns[0].is_empty());
    }
}
