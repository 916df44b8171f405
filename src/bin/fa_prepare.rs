//! `fa-prepare`: create a brand-new archive file with a given format
//! (BPM mask, decimation factors, sample counts) before `fa-archiverd`
//! is ever pointed at it.

use clap::Parser;
use fa_archiver::archive::header::{DiskHeader, HeaderParams};
use fa_archiver::archive::prepare;
use fa_archiver::error::{ArchiverError, AppResult};
use fa_archiver::frame::BpmMask;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fa-prepare", about = "Initialise a new FA sniffer archive file")]
struct Cli {
    /// Archive file to create (overwritten if it already exists).
    path: PathBuf,

    /// BPM selection: decimal ranges (`"0-3,10,200-201"`) or 64 hex
    /// characters (most-significant nibble first).
    #[arg(long)]
    archive_mask: String,

    /// Samples per decimation-1 group.
    #[arg(long, default_value_t = 64)]
    first_decimation: u32,

    /// Decimation-1 groups per decimation-2 record (0 disables level 2).
    #[arg(long, default_value_t = 256)]
    second_decimation: u32,

    /// Nominal device sample rate in Hz, stored verbatim for `CF`/`CFdD`.
    #[arg(long, default_value_t = 10_072.4)]
    sample_frequency: f64,

    /// Raw samples per major block; must be a multiple of `first_decimation`.
    #[arg(long, default_value_t = 512)]
    major_sample_count: u32,

    /// Number of major blocks in the archive's ring.
    #[arg(long, default_value_t = 4)]
    major_block_count: u32,

    /// Direct-IO / page alignment in bytes for section offsets.
    #[arg(long, default_value_t = 4096)]
    block_alignment: u64,

    /// Zero-fill the major data area as well as the index and DD areas
    /// (slower, but avoids serving stale bytes from a reused file).
    #[arg(long)]
    zero_fill_data: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("fa-prepare: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> AppResult<()> {
    let archive_mask = parse_mask(&cli.archive_mask)
        .ok_or_else(|| ArchiverError::Configuration(format!("invalid --archive-mask '{}'", cli.archive_mask)))?;

    let header = DiskHeader::derive(&HeaderParams {
        archive_mask,
        first_decimation: cli.first_decimation,
        second_decimation: cli.second_decimation,
        sample_frequency: cli.sample_frequency,
        major_sample_count: cli.major_sample_count,
        major_block_count: cli.major_block_count,
        block_alignment: cli.block_alignment,
    })?;

    prepare(&cli.path, &header, cli.zero_fill_data)?;

    println!(
        "created {} ({} BPMs, major_block_size={} bytes, major_block_count={}, total size={} bytes)",
        cli.path.display(),
        header.archive_mask_count,
        header.major_block_size,
        header.major_block_count,
        header.total_file_size(),
    );
    Ok(())
}

fn parse_mask(s: &str) -> Option<BpmMask> {
    if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        BpmMask::from_hex(s)
    } else {
        BpmMask::from_ranges(s)
    }
}
