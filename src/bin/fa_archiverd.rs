//! Capture daemon: reads the sniffer device (or a dummy generator) into
//! the in-memory ring buffer, runs the transform/decimation engine
//! against an already-prepared archive, and serves the socket protocol
//! over TCP. Run `fa-prepare` once before the first start.

use clap::Parser;
use fa_archiver::archive::reader::ArchiveReader;
use fa_archiver::archive::writer::ArchiveWriter;
use fa_archiver::config::{DeviceSettings, Settings};
use fa_archiver::device::{DeviceRead, DummySnifferDevice, RealSnifferDevice, SnifferDevice};
use fa_archiver::error::{ArchiverError, AppResult};
use fa_archiver::frame::Block;
use fa_archiver::logging::{self, LoggingConfig, OutputFormat};
use fa_archiver::network::{NetworkServer, ServerState};
use fa_archiver::ring::RingBuffer;
use fa_archiver::transform::TransformEngine;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fa-archiverd", about = "Fast Acquisition sniffer capture and archive daemon")]
struct Cli {
    /// Path to a TOML configuration file; defaults are used when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("fa-archiverd: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> AppResult<()> {
    let settings = Settings::load(cli.config.as_deref()).map_err(|e| ArchiverError::Configuration(e.to_string()))?;

    let level = LoggingConfig::level_from_str(&settings.log_level).map_err(ArchiverError::Configuration)?;
    logging::init(LoggingConfig::new(level, OutputFormat::Pretty)).map_err(ArchiverError::Configuration)?;

    info!(archive = %settings.archive.path.display(), "starting fa-archiverd");

    let block_alignment = settings.archive.block_alignment as u64;
    let writer = Arc::new(ArchiveWriter::open(&settings.archive.path, block_alignment)?);
    let reader = Arc::new(ArchiveReader::open(&settings.archive.path, block_alignment)?);
    let header = writer.header();

    let ring = RingBuffer::<Block>::new(settings.ring.slot_count);

    let (shutdown_tx, _) = watch::channel(false);
    let state = Arc::new(ServerState {
        ring: Arc::clone(&ring),
        reader: Arc::clone(&reader),
        archive_mask: header.archive_mask,
        first_decimation: header.first_decimation,
        second_decimation: header.second_decimation,
        frequency_bits: AtomicU64::new(header.sample_frequency.to_bits()),
        shutdown: shutdown_tx.clone(),
    });

    let cancel = Arc::new(AtomicBool::new(false));

    let transform_engine = TransformEngine::new(Arc::clone(&ring), Arc::clone(&writer))?;
    let transform_cancel = Arc::clone(&cancel);
    let transform_handle = std::thread::Builder::new()
        .name("fa-transform".into())
        .spawn(move || {
            if let Err(e) = transform_engine.run(&transform_cancel) {
                error!(error = %e, "transform engine exited with error");
            }
        })
        .map_err(|e| ArchiverError::Archive(format!("failed to spawn transform thread: {e}")))?;

    let device_frame_count = header.first_decimation.max(1) as usize;
    let device_cancel = Arc::clone(&cancel);
    let device_ring = Arc::clone(&ring);
    let device_settings = settings.device.clone();
    let device_handle = std::thread::Builder::new()
        .name("fa-device".into())
        .spawn(move || device_loop(&device_settings, &device_ring, device_frame_count, &device_cancel))
        .map_err(|e| ArchiverError::Device(format!("failed to spawn device thread: {e}")))?;

    let runtime = tokio::runtime::Runtime::new().map_err(ArchiverError::from)?;
    let server_addr = format!("{}:{}", settings.server.bind_address, settings.server.port);
    let run_result = runtime.block_on(async move {
        let server = NetworkServer::bind(&server_addr, Arc::clone(&state)).await?;
        tokio::select! {
            res = server.run() => res,
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt, shutting down");
                let _ = shutdown_tx.send(true);
                Ok(())
            }
        }
    });

    cancel.store(true, Ordering::Relaxed);
    device_handle.join().map_err(|_| ArchiverError::Device("device thread panicked".into()))?;
    transform_handle.join().map_err(|_| ArchiverError::Archive("transform thread panicked".into()))?;
    writer.flush()?;

    run_result
}

/// Own and re-open the device across transient failures; each iteration
/// of the outer loop represents one open-device session.
fn device_loop(settings: &DeviceSettings, ring: &Arc<RingBuffer<Block>>, frame_count: usize, cancel: &AtomicBool) {
    while !cancel.load(Ordering::Relaxed) {
        let mut device: Box<dyn SnifferDevice> = if settings.dummy {
            Box::new(DummySnifferDevice::new(settings.dummy_frame_rate_hz))
        } else {
            match RealSnifferDevice::open(Path::new(&settings.path)) {
                Ok(d) => Box::new(d),
                Err(e) => {
                    warn!(error = %e, "failed to open sniffer device, retrying in 1s");
                    sleep_unless_cancelled(cancel, Duration::from_secs(1));
                    continue;
                }
            }
        };

        while !cancel.load(Ordering::Relaxed) {
            match device.read_block(frame_count) {
                Ok(DeviceRead::Frames(block)) => {
                    let ts_us = now_unix_us();
                    ring.release_write_slot(false, ts_us, |slot| *slot = block);
                }
                Ok(DeviceRead::Gap) => {
                    let ts_us = now_unix_us();
                    ring.release_write_slot(true, ts_us, |_| {});
                }
                Err(e) => {
                    error!(error = %e, "device read failed, reopening in 1s");
                    sleep_unless_cancelled(cancel, Duration::from_secs(1));
                    break;
                }
            }
        }
    }
}

fn sleep_unless_cancelled(cancel: &AtomicBool, duration: Duration) {
    let deadline = std::time::Instant::now() + duration;
    while !cancel.load(Ordering::Relaxed) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn now_unix_us() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros() as u64).unwrap_or(0)
}
