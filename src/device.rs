//! Sniffer source: the trait both the real device node and the dummy
//! generator implement, so the daemon's capture loop has one call
//! site regardless of which backs it.

use crate::error::{ArchiverError, AppResult};
use crate::frame::{Block, Frame, FRAME_SIZE};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// Result of one device read: either a block of frames, or a detected
/// gap (a short read, or a hardware counter jump).
pub enum DeviceRead {
    Frames(Block),
    Gap,
}

/// Snapshot returned by `GET_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub running: bool,
    pub last_id0: u32,
}

/// Common contract for anything that can supply FA frames: the real
/// `/dev/fa0`-style device node, or the dummy sinusoidal generator.
pub trait SnifferDevice: Send {
    /// Read one device block (`frame_count` consecutive frames).
    fn read_block(&mut self, frame_count: usize) -> AppResult<DeviceRead>;

    fn ioctl_get_version(&mut self) -> AppResult<u32>;
    fn ioctl_get_status(&mut self) -> AppResult<DeviceStatus>;
    fn ioctl_get_timestamp(&mut self) -> AppResult<u64>;
    fn ioctl_restart(&mut self) -> AppResult<()>;
}

/// Number of retries on a transient `EBUSY` before giving up on a read.
const EBUSY_MAX_RETRIES: u32 = 5;
const EBUSY_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Real device backed by a device node (`/dev/fa0` by convention).
pub struct RealSnifferDevice {
    file: File,
    last_id0: u32,
}

impl RealSnifferDevice {
    pub fn open(path: &Path) -> AppResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| ArchiverError::Device(format!("opening {}: {e}", path.display())))?;
        Ok(Self { file, last_id0: 0 })
    }
}

impl SnifferDevice for RealSnifferDevice {
    fn read_block(&mut self, frame_count: usize) -> AppResult<DeviceRead> {
        let mut buf = vec![0u8; frame_count * FRAME_SIZE];
        let mut attempts = 0;
        let n = loop {
            match self.file.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempts < EBUSY_MAX_RETRIES => {
                    attempts += 1;
                    std::thread::sleep(EBUSY_RETRY_DELAY);
                }
                Err(e) => return Err(ArchiverError::Device(format!("read failed: {e}"))),
            }
        };

        if n < buf.len() {
            // A short read means the device dropped frames mid-block:
            // the caller treats the whole block as a gap rather than
            // trying to salvage a partial one.
            return Ok(DeviceRead::Gap);
        }

        let mut frames = Vec::with_capacity(frame_count);
        for chunk in buf.chunks_exact(FRAME_SIZE) {
            frames.push(Frame::from_bytes(chunk));
        }
        let id0 = self.last_id0;
        self.last_id0 = self.last_id0.wrapping_add(frame_count as u32);
        Ok(DeviceRead::Frames(Block { frames, id0 }))
    }

    #[cfg(target_os = "linux")]
    fn ioctl_get_version(&mut self) -> AppResult<u32> {
        use std::os::unix::io::AsRawFd;
        let mut version: u32 = 0;
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), FA_IOC_GET_VERSION, &mut version as *mut u32) };
        if rc < 0 {
            return Err(ArchiverError::Device(format!("GET_VERSION ioctl failed: {}", std::io::Error::last_os_error())));
        }
        Ok(version)
    }

    #[cfg(not(target_os = "linux"))]
    fn ioctl_get_version(&mut self) -> AppResult<u32> {
        Ok(1)
    }

    #[cfg(target_os = "linux")]
    fn ioctl_get_status(&mut self) -> AppResult<DeviceStatus> {
        use std::os::unix::io::AsRawFd;
        let mut running: u32 = 0;
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), FA_IOC_GET_STATUS, &mut running as *mut u32) };
        if rc < 0 {
            return Err(ArchiverError::Device(format!("GET_STATUS ioctl failed: {}", std::io::Error::last_os_error())));
        }
        Ok(DeviceStatus { running: running != 0, last_id0: self.last_id0 })
    }

    #[cfg(not(target_os = "linux"))]
    fn ioctl_get_status(&mut self) -> AppResult<DeviceStatus> {
        Ok(DeviceStatus { running: true, last_id0: self.last_id0 })
    }

    #[cfg(target_os = "linux")]
    fn ioctl_get_timestamp(&mut self) -> AppResult<u64> {
        use std::os::unix::io::AsRawFd;
        let mut ts: u64 = 0;
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), FA_IOC_GET_TIMESTAMP, &mut ts as *mut u64) };
        if rc < 0 {
            return Err(ArchiverError::Device(format!("GET_TIMESTAMP ioctl failed: {}", std::io::Error::last_os_error())));
        }
        Ok(ts)
    }

    #[cfg(not(target_os = "linux"))]
    fn ioctl_get_timestamp(&mut self) -> AppResult<u64> {
        Ok(0)
    }

    #[cfg(target_os = "linux")]
    fn ioctl_restart(&mut self) -> AppResult<()> {
        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), FA_IOC_RESTART, 0) };
        if rc < 0 {
            return Err(ArchiverError::Device(format!("RESTART ioctl failed: {}", std::io::Error::last_os_error())));
        }
        self.last_id0 = 0;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn ioctl_restart(&mut self) -> AppResult<()> {
        self.last_id0 = 0;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
const FA_IOC_MAGIC: u8 = 0xf0;
#[cfg(target_os = "linux")]
const FA_IOC_GET_VERSION: libc::c_ulong = nix::request_code_read!(FA_IOC_MAGIC, 1, std::mem::size_of::<u32>());
#[cfg(target_os = "linux")]
const FA_IOC_GET_STATUS: libc::c_ulong = nix::request_code_read!(FA_IOC_MAGIC, 2, std::mem::size_of::<u32>());
#[cfg(target_os = "linux")]
const FA_IOC_GET_TIMESTAMP: libc::c_ulong = nix::request_code_read!(FA_IOC_MAGIC, 3, std::mem::size_of::<u64>());
#[cfg(target_os = "linux")]
const FA_IOC_RESTART: libc::c_ulong = nix::request_code_none!(FA_IOC_MAGIC, 4);

/// Generates the nominal 10.0724 kHz sinusoidal test pattern, used when
/// no real device node is configured.
pub struct DummySnifferDevice {
    frame_rate_hz: f64,
    phase: f64,
    id0: u32,
}

impl DummySnifferDevice {
    pub fn new(frame_rate_hz: f64) -> Self {
        Self { frame_rate_hz, phase: 0.0, id0: 0 }
    }

    fn next_frame(&mut self) -> Frame {
        let mut frame = Frame::zeroed();
        for (id, point) in frame.points.iter_mut().enumerate() {
            let amplitude = 1000.0 + id as f64;
            let theta = self.phase + id as f64 * 0.01;
            point.x = (amplitude * theta.sin()) as i32;
            point.y = (amplitude * theta.cos()) as i32;
        }
        self.phase += std::f64::consts::TAU / self.frame_rate_hz.max(1.0);
        frame
    }
}

impl SnifferDevice for DummySnifferDevice {
    fn read_block(&mut self, frame_count: usize) -> AppResult<DeviceRead> {
        let frames: Vec<Frame> = (0..frame_count).map(|_| self.next_frame()).collect();
        let id0 = self.id0;
        self.id0 = self.id0.wrapping_add(frame_count as u32);
        Ok(DeviceRead::Frames(Block { frames, id0 }))
    }

    fn ioctl_get_version(&mut self) -> AppResult<u32> {
        Ok(1)
    }

    fn ioctl_get_status(&mut self) -> AppResult<DeviceStatus> {
        Ok(DeviceStatus { running: true, last_id0: self.id0 })
    }

    fn ioctl_get_timestamp(&mut self) -> AppResult<u64> {
        Ok(0)
    }

    fn ioctl_restart(&mut self) -> AppResult<()> {
        self.id0 = 0;
        self.phase = 0.0;
        Ok(())
    }
}
