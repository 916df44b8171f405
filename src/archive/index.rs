//! Per-major-block index entries and the timestamp⇄block mapping
//! service built on top of them.

use super::header::DiskHeader;

/// One index entry per major block, rewritten atomically after that
/// block's data is durable. Small enough (16 bytes) to be written with
/// a single aligned store on any target architecture this crate runs
/// on, so concurrent readers observe either the old or the new value,
/// never a torn mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct IndexEntry {
    pub id0: u32,
    pub timestamp_us: u64,
    pub duration_us: u32,
}

pub const INDEX_ENTRY_SIZE: usize = std::mem::size_of::<IndexEntry>();

impl IndexEntry {
    pub fn to_bytes(&self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        buf[0..4].copy_from_slice(&self.id0.to_le_bytes());
        buf[4..12].copy_from_slice(&self.timestamp_us.to_le_bytes());
        buf[12..16].copy_from_slice(&self.duration_us.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        debug_assert_eq!(buf.len(), INDEX_ENTRY_SIZE);
        Self {
            id0: u32::from_le_bytes(buf[0..4].try_into().unwrap_or_default()),
            timestamp_us: u64::from_le_bytes(buf[4..12].try_into().unwrap_or_default()),
            duration_us: u32::from_le_bytes(buf[12..16].try_into().unwrap_or_default()),
        }
    }

    fn is_valid(&self) -> bool {
        self.duration_us != 0
    }

    fn contains(&self, ts: u64) -> bool {
        self.is_valid() && ts >= self.timestamp_us && ts < self.timestamp_us + self.duration_us as u64
    }
}

/// Tolerance, in microseconds, allowed on the expected inter-block
/// duration before a run is considered non-contiguous.
const CONTIGUITY_TOLERANCE_US: i64 = 50;

/// Result of [`TimeIndex::timestamp_to_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexLookup {
    pub major_block: u32,
    pub sample_offset: u32,
    /// Samples remaining in the archive from this point onward,
    /// assuming the run stays contiguous.
    pub samples_remaining: u64,
}

/// Result of [`TimeIndex::check_contiguous`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContiguityReport {
    pub contiguous_blocks: u32,
    pub first_id0_gap: Option<(u32, u32)>,
    pub first_time_gap: Option<(u64, u64)>,
}

/// Read-only view over the index array plus the header fields needed
/// to interpret it. Callers snapshot a `Vec<IndexEntry>` under whatever
/// interlock guards concurrent writer access (see
/// [`crate::archive::Archive::request_read`]) before constructing one.
pub struct TimeIndex<'a> {
    header: &'a DiskHeader,
    entries: &'a [IndexEntry],
}

impl<'a> TimeIndex<'a> {
    pub fn new(header: &'a DiskHeader, entries: &'a [IndexEntry]) -> Self {
        Self { header, entries }
    }

    /// Search backwards from `current_major_block - 1` for the first
    /// block whose time range contains `ts`.
    pub fn timestamp_to_index(&self, ts: u64) -> Option<IndexLookup> {
        let n = self.header.major_block_count;
        if n == 0 {
            return None;
        }
        let start = (self.header.current_major_block + n - 1) % n;
        for step in 0..n {
            let idx = (start + n - step) % n;
            let entry = self.entries.get(idx as usize)?;
            if entry.contains(ts) {
                let sample_offset = (((ts - entry.timestamp_us) as f64 * self.header.sample_frequency
                    / 1_000_000.0)
                    .round()) as u32;
                let samples_remaining = self.samples_from(idx, sample_offset);
                return Some(IndexLookup {
                    major_block: idx,
                    sample_offset,
                    samples_remaining,
                });
            }
        }
        None
    }

    fn samples_from(&self, start_block: u32, sample_offset: u32) -> u64 {
        let contiguous = self.check_contiguous(start_block, self.header.major_block_count);
        let full_blocks = contiguous.contiguous_blocks.saturating_sub(1) as u64;
        let first_block_remaining = (self.header.major_sample_count as u64).saturating_sub(sample_offset as u64);
        first_block_remaining + full_blocks * self.header.major_sample_count as u64
    }

    /// How many consecutive blocks starting at `start` form an
    /// uninterrupted run (by `id0` and `timestamp_us` progression),
    /// plus the first observed gap of each kind if the run breaks
    /// before `n_blocks` is reached.
    pub fn check_contiguous(&self, start: u32, n_blocks: u32) -> ContiguityReport {
        let n = self.header.major_block_count;
        if n == 0 {
            return ContiguityReport::default();
        }
        let expected_duration_us =
            (self.header.major_sample_count as f64 / self.header.sample_frequency * 1_000_000.0) as i64;

        let mut report = ContiguityReport::default();
        let Some(first) = self.entries.get((start % n) as usize) else {
            return report;
        };
        if !first.is_valid() {
            return report;
        }
        let mut prev = *first;
        report.contiguous_blocks = 1;

        for step in 1..n_blocks.min(n) {
            let idx = ((start + step) % n) as usize;
            let Some(entry) = self.entries.get(idx) else { break };
            if !entry.is_valid() {
                break;
            }
            let id0_ok = entry.id0 == prev.id0.wrapping_add(self.header.major_sample_count);
            let expected_ts = prev.timestamp_us as i64 + expected_duration_us;
            let time_ok = (entry.timestamp_us as i64 - expected_ts).abs() <= CONTIGUITY_TOLERANCE_US;

            if !id0_ok && report.first_id0_gap.is_none() {
                report.first_id0_gap = Some((prev.id0, entry.id0));
            }
            if !time_ok && report.first_time_gap.is_none() {
                report.first_time_gap = Some((prev.timestamp_us, entry.timestamp_us));
            }
            if !id0_ok || !time_ok {
                break;
            }
            report.contiguous_blocks += 1;
            prev = *entry;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::header::HeaderParams;
    use crate::frame::BpmMask;

    fn header() -> DiskHeader {
        let mut mask = BpmMask::empty();
        mask.set(0);
        DiskHeader::derive(&HeaderParams {
            archive_mask: mask,
            first_decimation: 64,
            second_decimation: 256,
            sample_frequency: 10_000.0,
            major_sample_count: 1000,
            major_block_count: 4,
            block_alignment: 4096,
        })
        .unwrap()
    }

    #[test]
    fn index_round_trip() {
        let e = IndexEntry {
            id0: 42,
            timestamp_us: 1_700_000_000_000_000,
            duration_us: 100_000,
        };
        assert_eq!(IndexEntry::from_bytes(&e.to_bytes()), e);
    }

    #[test]
    fn timestamp_to_index_finds_containing_block() {
        let mut h = header();
        h.current_major_block = 0;
        let entries = vec![
            IndexEntry { id0: 0, timestamp_us: 1000, duration_us: 100 },
            IndexEntry { id0: 1000, timestamp_us: 1100, duration_us: 100 },
            IndexEntry { id0: 2000, timestamp_us: 1200, duration_us: 100 },
            IndexEntry::default(),
        ];
        let idx = TimeIndex::new(&h, &entries);
        let lookup = idx.timestamp_to_index(1150).unwrap();
        assert_eq!(lookup.major_block, 1);
    }

    #[test]
    fn check_contiguous_detects_id0_gap() {
        let h = header();
        let entries = vec![
            IndexEntry { id0: 0, timestamp_us: 0, duration_us: 100_000 },
            IndexEntry { id0: 1000, timestamp_us: 100_000, duration_us: 100_000 },
            // id0 should be 2000 for contiguity; it jumps to 5000
            IndexEntry { id0: 5000, timestamp_us: 200_000, duration_us: 100_000 },
            IndexEntry { id0: 6000, timestamp_us: 300_000, duration_us: 100_000 },
        ];
        let idx = TimeIndex::new(&h, &entries);
        let report = idx.check_contiguous(0, 4);
        assert_eq!(report.contiguous_blocks, 2);
        assert_eq!(report.first_id0_gap, Some((1000, 5000)));
    }

    #[test]
    fn check_contiguous_full_run() {
        let h = header();
        let entries = vec![
            IndexEntry { id0: 0, timestamp_us: 0, duration_us: 100_000 },
            IndexEntry { id0: 1000, timestamp_us: 100_000, duration_us: 100_000 },
            IndexEntry { id0: 2000, timestamp_us: 200_000, duration_us: 100_000 },
            IndexEntry { id0: 3000, timestamp_us: 300_000, duration_us: 100_000 },
        ];
        let idx = TimeIndex::new(&h, &entries);
        let report = idx.check_contiguous(0, 4);
        assert_eq!(report.contiguous_blocks, 4);
        assert!(report.first_id0_gap.is_none());
        assert!(report.first_time_gap.is_none());
    }
}
