//! Configuration management for the archiver daemon.
//!
//! Settings are loaded from a TOML file (with environment variable
//! overrides) using the `config`/`figment` crates, then validated with
//! [`crate::validation`]. Invalid configuration is reported once, at
//! startup, and the process does not start.
//!
//! ## Schema
//!
//! - **`log_level`**: logging verbosity (`trace`..`error`).
//! - **`device`**: sniffer device path, or dummy-mode generation rate.
//! - **`archive`**: path to the archive file the daemon writes to.
//! - **`server`**: socket bind address for the command/data protocol.
//! - **`ring`**: in-memory ring buffer slot count.

use crate::validation::{is_in_range, is_not_empty, is_valid_ip, is_valid_path, is_valid_port};
use anyhow::{Context, Result};
use figment::{
    providers::{Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

impl Provider for Settings {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("fa-archiver defaults")
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(Settings::default()).data()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub device: DeviceSettings,
    pub archive: ArchiveSettings,
    pub server: ServerSettings,
    pub ring: RingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            device: DeviceSettings::default(),
            archive: ArchiveSettings::default(),
            server: ServerSettings::default(),
            ring: RingSettings::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceSettings {
    /// Path to the sniffer device node. Ignored when `dummy` is set.
    pub path: String,
    /// Generate a synthetic sinusoidal stream instead of opening `path`.
    pub dummy: bool,
    /// Nominal frame rate for dummy mode, in Hz.
    pub dummy_frame_rate_hz: f64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            path: "/dev/fa0".to_string(),
            dummy: false,
            dummy_frame_rate_hz: 10_072.4,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ArchiveSettings {
    /// Path to the archive file the writer opens with O_DIRECT.
    pub path: PathBuf,
    /// Direct-IO / page alignment in bytes; all section offsets are
    /// multiples of this value.
    pub block_alignment: usize,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./archive.fa"),
            block_alignment: 4096,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RingSettings {
    /// Number of block-sized slots in the in-memory ring (N >= 3).
    pub slot_count: usize,
}

impl Default for RingSettings {
    fn default() -> Self {
        Self { slot_count: 64 }
    }
}

impl Settings {
    /// Load defaults, then merge a TOML file (if present) and
    /// `FA_`-prefixed environment variables on top.
    pub fn load(config_path: Option<&std::path::Path>) -> Result<Self> {
        let mut figment = Figment::from(Settings::default());
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(figment::providers::Env::prefixed("FA_").split("__"));

        let settings: Settings = figment.extract().context("failed to load configuration")?;
        settings.validate().context("invalid configuration")?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        is_not_empty(&self.log_level)
            .map_err(anyhow::Error::msg)
            .context("log_level cannot be empty")?;
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.log_level.to_lowercase().as_str()) {
            anyhow::bail!("invalid log level: {}", self.log_level);
        }

        if !self.device.dummy {
            is_not_empty(&self.device.path)
                .map_err(anyhow::Error::msg)
                .context("device.path cannot be empty unless device.dummy is set")?;
        }
        is_in_range(self.device.dummy_frame_rate_hz, 1.0..=1_000_000.0)
            .map_err(anyhow::Error::msg)
            .context("device.dummy_frame_rate_hz out of range")?;

        is_valid_path(&self.archive.path.to_string_lossy())
            .map_err(anyhow::Error::msg)
            .context("archive.path invalid")?;
        if !self.archive.block_alignment.is_power_of_two() {
            anyhow::bail!("archive.block_alignment must be a power of two");
        }

        is_valid_port(self.server.port)
            .map_err(anyhow::Error::msg)
            .context("server.port invalid")?;
        is_valid_ip(&self.server.bind_address)
            .map_err(anyhow::Error::msg)
            .context("server.bind_address invalid")?;

        is_in_range(self.ring.slot_count, 3..=65536)
            .map_err(anyhow::Error::msg)
            .context("ring.slot_count must be between 3 and 65536")?;

        Ok(())
    }
}
