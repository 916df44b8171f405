//! `fa-capture`: connect to a running `fa-archiverd`, issue a live
//! subscribe or historical read, and write the result as raw binary or
//! (with `-M`) a matlab-v5 container.
//!
//! Exit codes: 0 success, 1 bad arguments, 2 runtime failure (§6 CLI
//! contract).

use chrono::{DateTime, Utc};
use clap::Parser;
use fa_archiver::error::{ArchiverError, AppResult};
use fa_archiver::frame::{BpmMask, Point, ENTRY_SIZE};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fa-capture", about = "Read live or historical data from an FA sniffer archiver")]
struct Cli {
    /// BPM selection: decimal ranges ("0-3,10,200-201") or "R" plus 64 hex chars.
    mask: String,

    /// Number of samples to capture.
    #[arg(short = 'n', long)]
    n_samples: u32,

    /// Archiver daemon address (host:port).
    #[arg(long, default_value = "127.0.0.1:8000")]
    server: String,

    /// Stream live data instead of issuing a historical read.
    #[arg(short = 'C', long)]
    continuous: bool,

    /// Historical read start time, RFC 3339 (required unless `-C`).
    #[arg(short = 's', long)]
    start: Option<String>,

    /// Require the requested run to be fully contiguous.
    #[arg(short = 'c', long)]
    contiguous: bool,

    /// Write a matlab-v5 container instead of a raw binary stream.
    #[arg(short = 'M', long)]
    matlab: bool,

    /// Output file; stdout if absent.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => {}
        Err(e @ ArchiverError::Configuration(_)) => {
            eprintln!("fa-capture: {e}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("fa-capture: {e}");
            std::process::exit(2);
        }
    }
}

fn run(cli: Cli) -> AppResult<()> {
    let mask = parse_mask(&cli.mask)
        .ok_or_else(|| ArchiverError::Configuration(format!("invalid mask '{}'", cli.mask)))?;
    let n_bpms = mask.count();
    if n_bpms == 0 {
        return Err(ArchiverError::Configuration("mask selects no BPMs".into()));
    }
    if cli.matlab && cli.n_samples == 0 {
        return Err(ArchiverError::Configuration("-M requires -n greater than zero".into()));
    }

    let command_line = if cli.continuous {
        format!("S{}", cli.mask)
    } else {
        let start = cli
            .start
            .as_deref()
            .ok_or_else(|| ArchiverError::Configuration("historical reads require --start".into()))?;
        let start_us = parse_start_time(start)?;
        let mut line = format!("RFM{}S{:.6}N{}", cli.mask, start_us as f64 / 1_000_000.0, cli.n_samples);
        if cli.contiguous {
            line.push('C');
        }
        line
    };

    let mut stream = TcpStream::connect(&cli.server)
        .map_err(|e| ArchiverError::Device(format!("could not connect to {}: {e}", cli.server)))?;
    stream.write_all(command_line.as_bytes())?;
    stream.write_all(b"\n")?;

    let mut marker = [0u8; 1];
    stream.read_exact(&mut marker)?;
    if marker[0] != 0 {
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest)?;
        let mut message = vec![marker[0]];
        message.extend(rest);
        let text = String::from_utf8_lossy(&message).trim_end().to_string();
        return Err(ArchiverError::Protocol(text));
    }

    let n_samples = cli.n_samples as usize;
    let payload_len = n_samples * n_bpms * ENTRY_SIZE;
    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload)?;

    let columns = frame_major_to_columns(&payload, n_bpms);

    let mut out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout()),
    };

    if cli.matlab {
        write_matlab_columns(&mut out, &columns)?;
    } else {
        out.write_all(&payload)?;
    }
    out.flush()?;
    Ok(())
}

/// `matrw` writes its container via random-access file I/O, so a
/// piped `-o`-less invocation (`capture -M ... > f.mat`) still needs a
/// real path on disk: stage the container in a scratch file, then copy
/// its bytes to the chosen output.
#[cfg(feature = "storage_matlab")]
fn write_matlab_columns(out: &mut dyn Write, columns: &[Vec<Point>]) -> AppResult<()> {
    use std::time::{SystemTime, UNIX_EPOCH};
    let first_sample_unix_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);

    let scratch = std::env::temp_dir().join(format!("fa-capture-{}.mat", uuid::Uuid::new_v4()));
    fa_archiver::matlab::write_capture(&scratch, columns, first_sample_unix_us)?;
    let mut bytes = Vec::new();
    std::fs::File::open(&scratch)?.read_to_end(&mut bytes)?;
    let _ = std::fs::remove_file(&scratch);
    out.write_all(&bytes)?;
    Ok(())
}

#[cfg(not(feature = "storage_matlab"))]
fn write_matlab_columns(_out: &mut dyn Write, _columns: &[Vec<Point>]) -> AppResult<()> {
    Err(ArchiverError::Configuration(
        "-M requires the storage_matlab feature".into(),
    ))
}

/// Split a `(frame, bpm)` row-major raw stream into per-BPM columns.
fn frame_major_to_columns(payload: &[u8], n_bpms: usize) -> Vec<Vec<Point>> {
    let n_samples = payload.len() / ENTRY_SIZE / n_bpms.max(1);
    let mut columns = vec![Vec::with_capacity(n_samples); n_bpms];
    for frame in 0..n_samples {
        for bpm in 0..n_bpms {
            let off = (frame * n_bpms + bpm) * ENTRY_SIZE;
            let x = i32::from_le_bytes(payload[off..off + 4].try_into().unwrap_or_default());
            let y = i32::from_le_bytes(payload[off + 4..off + 8].try_into().unwrap_or_default());
            columns[bpm].push(Point { x, y });
        }
    }
    columns
}

fn parse_mask(s: &str) -> Option<BpmMask> {
    if let Some(hex) = s.strip_prefix('R') {
        BpmMask::from_hex(hex)
    } else {
        BpmMask::from_ranges(s)
    }
}

fn parse_start_time(s: &str) -> AppResult<u64> {
    let dt: DateTime<Utc> = DateTime::parse_from_rfc3339(s)
        .map_err(|e| ArchiverError::Configuration(format!("invalid --start '{s}': {e}")))?
        .with_timezone(&Utc);
    Ok(dt.timestamp_micros().max(0) as u64)
}
