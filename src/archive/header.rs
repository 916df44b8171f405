//! On-disk archive header: signature, format parameters, derived section
//! offsets. Fixed-size, page-aligned, manually (de)serialized because
//! the layout is an external wire contract, not an internal data
//! structure `serde` should own.

use crate::error::{ArchiverError, AppResult};
use crate::frame::{BpmMask, DECIMATED_RECORD_SIZE, ENTRY_SIZE};

/// Bytes occupied by the header at the start of the archive file.
pub const HEADER_SIZE: usize = 4096;

/// 7-byte ASCII signature identifying an archive file, NUL-padded to 8.
pub const SIGNATURE: [u8; 8] = *b"FASNIFF\0";

/// Only header schema this crate understands. A version-0 header (3-bit
/// data mask, no `std` field) is detected and rejected rather than
/// silently misread.
pub const CURRENT_VERSION: u32 = 1;

/// Archive format parameters and derived layout, held in memory for the
/// lifetime of an open archive and persisted verbatim to the first
/// [`HEADER_SIZE`] bytes of the file.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskHeader {
    pub version: u32,
    pub archive_mask: BpmMask,
    pub archive_mask_count: u32,
    pub first_decimation: u32,
    pub second_decimation: u32,
    pub sample_frequency: f64,
    pub major_sample_count: u32,
    pub d_sample_count: u32,
    pub dd_sample_count: u32,
    pub major_block_count: u32,
    pub major_block_size: u64,
    pub major_data_start: u64,
    pub index_data_start: u64,
    pub index_data_size: u64,
    pub dd_data_start: u64,
    pub dd_data_size: u64,
    /// Next major block the writer will fill; wraps modulo
    /// `major_block_count`. The only field mutated after `prepare`.
    pub current_major_block: u32,
}

/// Parameters a caller supplies to [`DiskHeader::derive`]; everything
/// else is computed.
#[derive(Debug, Clone)]
pub struct HeaderParams {
    pub archive_mask: BpmMask,
    pub first_decimation: u32,
    pub second_decimation: u32,
    pub sample_frequency: f64,
    pub major_sample_count: u32,
    pub major_block_count: u32,
    pub block_alignment: u64,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) / alignment * alignment
}

impl DiskHeader {
    /// Compute every derived field from the given parameters, as the
    /// `prepare` CLI does at archive-creation time.
    pub fn derive(p: &HeaderParams) -> AppResult<Self> {
        if p.first_decimation == 0 || p.second_decimation == 0 {
            return Err(ArchiverError::Archive(
                "first_decimation and second_decimation must be nonzero".into(),
            ));
        }
        if p.major_sample_count % p.first_decimation != 0 {
            return Err(ArchiverError::Archive(
                "major_sample_count must be a multiple of first_decimation".into(),
            ));
        }
        let archive_mask_count = p.archive_mask.count() as u32;
        if archive_mask_count == 0 {
            return Err(ArchiverError::Archive("archive_mask selects no BPMs".into()));
        }

        let d_sample_count = p.major_sample_count / p.first_decimation;
        let dd_sample_count = d_sample_count / p.second_decimation;

        let fa_bytes = archive_mask_count as u64 * p.major_sample_count as u64 * ENTRY_SIZE as u64;
        let d_bytes = archive_mask_count as u64 * d_sample_count as u64 * DECIMATED_RECORD_SIZE as u64;
        let major_block_size = fa_bytes + d_bytes;

        let index_entry_size = super::index::INDEX_ENTRY_SIZE as u64;
        let index_data_size = index_entry_size * p.major_block_count as u64;
        let index_data_start = HEADER_SIZE as u64;

        let dd_data_size =
            archive_mask_count as u64 * p.major_block_count as u64 * dd_sample_count as u64 * DECIMATED_RECORD_SIZE as u64;
        let dd_data_start = align_up(index_data_start + index_data_size, p.block_alignment);

        let major_data_start = align_up(dd_data_start + dd_data_size, p.block_alignment);

        Ok(Self {
            version: CURRENT_VERSION,
            archive_mask: p.archive_mask,
            archive_mask_count,
            first_decimation: p.first_decimation,
            second_decimation: p.second_decimation,
            sample_frequency: p.sample_frequency,
            major_sample_count: p.major_sample_count,
            d_sample_count,
            dd_sample_count,
            major_block_count: p.major_block_count,
            major_block_size,
            major_data_start,
            index_data_start,
            index_data_size,
            dd_data_start,
            dd_data_size,
            current_major_block: 0,
        })
    }

    /// Total archive file size implied by this header.
    pub fn total_file_size(&self) -> u64 {
        self.major_data_start + self.major_block_count as u64 * self.major_block_size
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let mut off = 0usize;
        macro_rules! put {
            ($bytes:expr) => {{
                let b = $bytes;
                buf[off..off + b.len()].copy_from_slice(&b);
                off += b.len();
            }};
        }
        put!(SIGNATURE);
        put!(self.version.to_le_bytes());
        put!(self.archive_mask.to_bytes());
        put!(self.archive_mask_count.to_le_bytes());
        put!(self.first_decimation.to_le_bytes());
        put!(self.second_decimation.to_le_bytes());
        put!(self.sample_frequency.to_le_bytes());
        put!(self.major_sample_count.to_le_bytes());
        put!(self.d_sample_count.to_le_bytes());
        put!(self.dd_sample_count.to_le_bytes());
        put!(self.major_block_count.to_le_bytes());
        put!(self.major_block_size.to_le_bytes());
        put!(self.major_data_start.to_le_bytes());
        put!(self.index_data_start.to_le_bytes());
        put!(self.index_data_size.to_le_bytes());
        put!(self.dd_data_start.to_le_bytes());
        put!(self.dd_data_size.to_le_bytes());
        put!(self.current_major_block.to_le_bytes());
        buf
    }

    /// Parse and validate a header read from disk. Checks signature,
    /// version, and that every derived section fits within `file_size`
    /// and is aligned to `block_alignment`.
    pub fn from_bytes(buf: &[u8], file_size: u64, block_alignment: u64) -> AppResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ArchiverError::InvalidHeader("header truncated".into()));
        }
        let mut off = 0usize;
        macro_rules! take {
            ($n:expr) => {{
                let s = &buf[off..off + $n];
                off += $n;
                s
            }};
        }
        let signature = take!(8);
        if signature != SIGNATURE {
            return Err(ArchiverError::InvalidHeader("bad signature".into()));
        }
        let version = u32::from_le_bytes(take!(4).try_into().unwrap_or_default());
        if version == 0 {
            return Err(ArchiverError::InvalidHeader(
                "version 0 archives (3-bit data mask) are not supported".into(),
            ));
        }
        if version != CURRENT_VERSION {
            return Err(ArchiverError::InvalidHeader(format!("unsupported version {version}")));
        }
        let mask_bytes: [u8; 32] = take!(32).try_into().unwrap_or([0; 32]);
        let archive_mask = BpmMask::from_bytes(&mask_bytes);
        let archive_mask_count = u32::from_le_bytes(take!(4).try_into().unwrap_or_default());
        let first_decimation = u32::from_le_bytes(take!(4).try_into().unwrap_or_default());
        let second_decimation = u32::from_le_bytes(take!(4).try_into().unwrap_or_default());
        let sample_frequency = f64::from_le_bytes(take!(8).try_into().unwrap_or_default());
        let major_sample_count = u32::from_le_bytes(take!(4).try_into().unwrap_or_default());
        let d_sample_count = u32::from_le_bytes(take!(4).try_into().unwrap_or_default());
        let dd_sample_count = u32::from_le_bytes(take!(4).try_into().unwrap_or_default());
        let major_block_count = u32::from_le_bytes(take!(4).try_into().unwrap_or_default());
        let major_block_size = u64::from_le_bytes(take!(8).try_into().unwrap_or_default());
        let major_data_start = u64::from_le_bytes(take!(8).try_into().unwrap_or_default());
        let index_data_start = u64::from_le_bytes(take!(8).try_into().unwrap_or_default());
        let index_data_size = u64::from_le_bytes(take!(8).try_into().unwrap_or_default());
        let dd_data_start = u64::from_le_bytes(take!(8).try_into().unwrap_or_default());
        let dd_data_size = u64::from_le_bytes(take!(8).try_into().unwrap_or_default());
        let current_major_block = u32::from_le_bytes(take!(4).try_into().unwrap_or_default());

        let header = Self {
            version,
            archive_mask,
            archive_mask_count,
            first_decimation,
            second_decimation,
            sample_frequency,
            major_sample_count,
            d_sample_count,
            dd_sample_count,
            major_block_count,
            major_block_size,
            major_data_start,
            index_data_start,
            index_data_size,
            dd_data_start,
            dd_data_size,
            current_major_block,
        };
        header.validate(file_size, block_alignment)?;
        Ok(header)
    }

    fn validate(&self, file_size: u64, block_alignment: u64) -> AppResult<()> {
        let check_aligned = |name: &str, value: u64| -> AppResult<()> {
            if value % block_alignment != 0 {
                return Err(ArchiverError::InvalidHeader(format!(
                    "{name} ({value}) is not aligned to {block_alignment}"
                )));
            }
            Ok(())
        };
        check_aligned("index_data_start", self.index_data_start)?;
        check_aligned("dd_data_start", self.dd_data_start)?;
        check_aligned("major_data_start", self.major_data_start)?;
        // `major_block_size` itself is not required to be a multiple of
        // `block_alignment`: only the first major block's start offset
        // is guaranteed aligned. Later blocks may start mid-sector; the
        // archive still works, just without the direct-IO fast path for
        // those writes on every platform.

        if self.index_data_start + self.index_data_size > self.dd_data_start {
            return Err(ArchiverError::InvalidHeader("index area overlaps dd area".into()));
        }
        if self.dd_data_start + self.dd_data_size > self.major_data_start {
            return Err(ArchiverError::InvalidHeader("dd area overlaps major area".into()));
        }
        if self.total_file_size() > file_size {
            return Err(ArchiverError::InvalidHeader(format!(
                "archive file is {file_size} bytes, header requires {}",
                self.total_file_size()
            )));
        }
        if self.archive_mask_count != self.archive_mask.count() as u32 {
            return Err(ArchiverError::InvalidHeader(
                "archive_mask_count does not match popcount(archive_mask)".into(),
            ));
        }
        if self.current_major_block >= self.major_block_count {
            return Err(ArchiverError::InvalidHeader("current_major_block out of range".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> HeaderParams {
        let mut mask = BpmMask::empty();
        mask.set(0);
        mask.set(1);
        mask.set(2);
        HeaderParams {
            archive_mask: mask,
            first_decimation: 64,
            second_decimation: 256,
            sample_frequency: 10_072.4,
            major_sample_count: 512,
            major_block_count: 4,
            block_alignment: 4096,
        }
    }

    #[test]
    fn derive_then_round_trip() {
        let header = DiskHeader::derive(&params()).unwrap();
        let bytes = header.to_bytes();
        let back = DiskHeader::from_bytes(&bytes, header.total_file_size(), 4096).unwrap();
        assert_eq!(back, header);
    }

    #[test]
    fn derive_matches_scenario_one() {
        let header = DiskHeader::derive(&params()).unwrap();
        assert_eq!(header.d_sample_count, 8);
        assert_eq!(header.dd_sample_count, 0);
        assert_eq!(header.sample_frequency, 10_072.4);
    }

    #[test]
    fn rejects_version_zero() {
        let header = DiskHeader::derive(&params()).unwrap();
        let mut bytes = header.to_bytes();
        bytes[8..12].copy_from_slice(&0u32.to_le_bytes());
        let err = DiskHeader::from_bytes(&bytes, header.total_file_size(), 4096).unwrap_err();
        assert!(matches!(err, ArchiverError::InvalidHeader(_)));
    }

    #[test]
    fn rejects_truncated_file() {
        let header = DiskHeader::derive(&params()).unwrap();
        let bytes = header.to_bytes();
        let err = DiskHeader::from_bytes(&bytes, header.total_file_size() - 1, 4096).unwrap_err();
        assert!(matches!(err, ArchiverError::InvalidHeader(_)));
    }

    #[test]
    fn rejects_bad_signature() {
        let header = DiskHeader::derive(&params()).unwrap();
        let mut bytes = header.to_bytes();
        bytes[0] = b'X';
        assert!(DiskHeader::from_bytes(&bytes, header.total_file_size(), 4096).is_err());
    }
}
