//! Per-connection session handling: dispatches one parsed [`Command`]
//! against shared daemon state and drives the connection's response
//! framing (NUL success marker, optional prelude, then payload; or a
//! plain error line on rejection).

use super::protocol::{encode_gap_list, Command, FieldMask, Source};
use crate::archive::reader::ArchiveReader;
use crate::error::{ArchiverError, AppResult};
use crate::frame::{Block, BpmMask, DecimatedRecord, ENTRY_SIZE};
use crate::ring::{ReadOutcomeOwned, RingBuffer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// State shared by every connected session.
pub struct ServerState {
    pub ring: Arc<RingBuffer<Block>>,
    pub reader: Arc<ArchiveReader>,
    pub archive_mask: BpmMask,
    pub first_decimation: u32,
    pub second_decimation: u32,
    /// Measured mean frame rate, updated by the sniffer source; stored
    /// as raw `f64` bits so it can be read/written without a mutex.
    pub frequency_bits: AtomicU64,
    pub shutdown: watch::Sender<bool>,
}

impl ServerState {
    pub fn frequency(&self) -> f64 {
        f64::from_bits(self.frequency_bits.load(Ordering::Relaxed))
    }

    pub fn set_frequency(&self, hz: f64) {
        self.frequency_bits.store(hz.to_bits(), Ordering::Relaxed);
    }
}

/// Handle one accepted connection end to end. Errors here are logged
/// by the caller; they never propagate past this function.
pub async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> AppResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let n = tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line).await?;
    if n == 0 {
        return Ok(());
    }
    let line = line.trim_end_matches(['\n', '\r']);

    let command = match Command::parse(line) {
        Ok(c) => c,
        Err(e) => {
            write_error(&mut write_half, &e).await?;
            return Ok(());
        }
    };

    match command {
        Command::CurrentFrequency => {
            write_half.write_all(format!("{}\n", state.frequency()).as_bytes()).await?;
        }
        Command::CurrentFrequencyAndDecimations => {
            write_half
                .write_all(
                    format!("{}\n{}\n{}\n", state.frequency(), state.first_decimation, state.second_decimation)
                        .as_bytes(),
                )
                .await?;
        }
        Command::Quit => {
            let _ = state.shutdown.send(true);
        }
        Command::Subscribe { mask, prepend_timestamp } => {
            if let Err(e) = run_subscribe(&mut write_half, &state, mask, prepend_timestamp).await {
                write_error(&mut write_half, &e).await?;
            }
        }
        Command::Read {
            source,
            mask,
            start,
            n_samples,
            require_contiguous,
            prepend_timestamp,
            prepend_gap_list,
        } => {
            let result = run_read(
                &mut write_half,
                &state,
                source,
                mask,
                start.unix_us,
                n_samples,
                require_contiguous,
                prepend_timestamp,
                prepend_gap_list,
            )
            .await;
            if let Err(e) = result {
                write_error(&mut write_half, &e).await?;
            }
        }
    }

    Ok(())
}

async fn write_error(write_half: &mut tokio::net::tcp::OwnedWriteHalf, err: &ArchiverError) -> AppResult<()> {
    write_half.write_all(err.wire_message().as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    Ok(())
}

async fn run_subscribe(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    state: &Arc<ServerState>,
    mask: BpmMask,
    prepend_timestamp: bool,
) -> AppResult<()> {
    if !mask.is_subset_of(&state.archive_mask) {
        let bad = mask.ids().find(|id| !state.archive_mask.contains(*id)).unwrap_or(0);
        return Err(ArchiverError::UnknownBpm(bad));
    }

    let ring = Arc::clone(&state.ring);
    let reader_id = {
        let ring = Arc::clone(&ring);
        tokio::task::spawn_blocking(move || ring.open_reader(false))
            .await
            .map_err(|e| ArchiverError::Protocol(format!("subscribe setup failed: {e}")))?
    };

    write_half.write_all(&[0u8]).await?;

    let mut shutdown = state.shutdown.subscribe();
    let mut wrote_timestamp = !prepend_timestamp;

    loop {
        let ring = Arc::clone(&ring);
        let outcome = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            outcome = tokio::task::spawn_blocking(move || ring.get_read_slot_cloned(reader_id)) => {
                outcome.map_err(|e| ArchiverError::Protocol(format!("ring read failed: {e}")))?
            }
        };

        match outcome {
            ReadOutcomeOwned::Data(block, ts_us, _seq) => {
                if !wrote_timestamp {
                    write_half.write_all(&ts_us.to_le_bytes()).await?;
                    wrote_timestamp = true;
                }
                let payload = filter_block(&block, &mask);
                write_half.write_all(&payload).await?;
            }
            ReadOutcomeOwned::Gap => continue,
            ReadOutcomeOwned::Underflow => return Err(ArchiverError::Underrun),
            ReadOutcomeOwned::Closed => break,
        }
    }

    let ring = Arc::clone(&state.ring);
    tokio::task::spawn_blocking(move || ring.close_reader(reader_id)).await.ok();
    Ok(())
}

/// Filter `block` down to `mask`'s BPMs, emitting `(x, y)` pairs in
/// frame order, ascending BPM-id order within each frame.
fn filter_block(block: &Block, mask: &BpmMask) -> Vec<u8> {
    let ids: Vec<u16> = mask.ids().collect();
    let mut out = Vec::with_capacity(block.frames.len() * ids.len() * ENTRY_SIZE);
    for frame in &block.frames {
        for &id in &ids {
            let p = frame.points[id as usize];
            out.extend_from_slice(&p.x.to_le_bytes());
            out.extend_from_slice(&p.y.to_le_bytes());
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
async fn run_read(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    state: &Arc<ServerState>,
    source: Source,
    mask: BpmMask,
    start_us: u64,
    n_samples: u32,
    require_contiguous: bool,
    prepend_timestamp: bool,
    prepend_gap_list: bool,
) -> AppResult<()> {
    if !mask.is_subset_of(&state.archive_mask) {
        let bad = mask.ids().find(|id| !state.archive_mask.contains(*id)).unwrap_or(0);
        return Err(ArchiverError::UnknownBpm(bad));
    }

    let reader = Arc::clone(&state.reader);
    let (major_block, sample_offset, samples_remaining) = reader.timestamp_to_index(start_us)?;

    let header = reader.header();
    let column_sample_count = match source {
        Source::Fa => header.major_sample_count,
        Source::D(_) => header.d_sample_count,
        Source::Dd(_) => header.dd_sample_count,
    };
    let n_blocks_needed = (sample_offset as u64 + n_samples as u64).div_ceil(header.major_sample_count as u64) as u32;
    let n_blocks_needed = n_blocks_needed.max(1);
    let (report, gap_entry) = reader.check_contiguous(major_block, n_blocks_needed);
    let is_contiguous = (n_samples as u64) <= samples_remaining && report.contiguous_blocks >= n_blocks_needed;

    if require_contiguous && !is_contiguous {
        return Err(ArchiverError::NotContiguous);
    }

    write_half.write_all(&[0u8]).await?;

    if prepend_timestamp {
        write_half.write_all(&start_us.to_le_bytes()).await?;
    }
    if prepend_gap_list {
        let start_entry = reader.index_entry(major_block);
        let start_id0 = start_entry.map(|e| e.id0.wrapping_add(sample_offset)).unwrap_or(0);
        let second_tuple = if report.contiguous_blocks < n_blocks_needed {
            // The run breaks inside the requested range: report the
            // real discontinuity, not an extrapolated end-of-range.
            let consumed = (report.contiguous_blocks as u64 * column_sample_count as u64)
                .saturating_sub(sample_offset as u64)
                .min(n_samples as u64) as u32;
            match gap_entry {
                Some(entry) => (consumed, entry.id0, entry.timestamp_us),
                None => (n_samples, start_id0, start_us),
            }
        } else {
            (n_samples, start_id0, start_us)
        };
        let tuples = [(0u32, start_id0, start_us), second_tuple];
        write_half.write_all(&encode_gap_list(&tuples)).await?;
    }

    let mut payload = Vec::new();
    match source {
        Source::Fa => {
            reader.read_fa_transposed(&mask, major_block, sample_offset, n_samples, &mut payload)?;
        }
        Source::D(fields) => {
            read_decimated_transposed(&reader, false, &mask, fields, major_block, sample_offset, n_samples, &mut payload)?;
        }
        Source::Dd(fields) => {
            read_decimated_transposed(&reader, true, &mask, fields, major_block, sample_offset, n_samples, &mut payload)?;
        }
    }
    write_half.write_all(&payload).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn read_decimated_transposed(
    reader: &Arc<ArchiveReader>,
    doubly: bool,
    mask: &BpmMask,
    fields: FieldMask,
    major_block: u32,
    sample_offset: u32,
    n_samples: u32,
    out: &mut Vec<u8>,
) -> AppResult<()> {
    let mut columns: Vec<Vec<DecimatedRecord>> = Vec::new();
    for id in mask.ids() {
        let mut raw = Vec::new();
        if doubly {
            reader.read_dd(id, major_block, sample_offset, n_samples, &mut raw)?;
        } else {
            reader.read_d(id, major_block, sample_offset, n_samples, &mut raw)?;
        }
        columns.push(ArchiveReader::parse_decimated(&raw));
    }

    for sample in 0..n_samples as usize {
        for column in &columns {
            let record = &column[sample];
            if fields.contains(FieldMask::MEAN) {
                out.extend_from_slice(&record.mean_x.to_le_bytes());
                out.extend_from_slice(&record.mean_y.to_le_bytes());
            }
            if fields.contains(FieldMask::MIN) {
                out.extend_from_slice(&record.min_x.to_le_bytes());
                out.extend_from_slice(&record.min_y.to_le_bytes());
            }
            if fields.contains(FieldMask::MAX) {
                out.extend_from_slice(&record.max_x.to_le_bytes());
                out.extend_from_slice(&record.max_y.to_le_bytes());
            }
            if fields.contains(FieldMask::STD) {
                out.extend_from_slice(&record.std_x.to_le_bytes());
                out.extend_from_slice(&record.std_y.to_le_bytes());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, Point};

    #[test]
    fn filter_block_keeps_only_masked_bpms_in_order() {
        let mut frame = Frame::zeroed();
        frame.points[1] = Point { x: 1, y: 2 };
        frame.points[5] = Point { x: 3, y: 4 };
        let block = Block { frames: vec![frame], id0: 0 };

        let mut mask = BpmMask::empty();
        mask.set(5);
        mask.set(1);
        let out = filter_block(&block, &mask);

        // ids() yields ascending order, so BPM 1 comes first.
        assert_eq!(out.len(), 2 * ENTRY_SIZE);
        assert_eq!(i32::from_le_bytes(out[0..4].try_into().unwrap()), 1);
        assert_eq!(i32::from_le_bytes(out[4..8].try_into().unwrap()), 2);
        assert_eq!(i32::from_le_bytes(out[8..12].try_into().unwrap()), 3);
    }
}
