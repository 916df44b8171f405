//! Structured logging initialisation.
//!
//! Thin wrapper around `tracing`/`tracing-subscriber` with three output
//! formats, chosen so the daemon can log human-readable text in
//! development and JSON in production without touching call sites.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for the process's log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed, multi-line, ANSI-colored (development).
    Pretty,
    /// Single-line, no colors (production console/journal).
    Compact,
    /// One JSON object per event (log aggregation).
    Json,
}

/// Logging configuration, derived from [`crate::config::Settings`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: OutputFormat,
    pub with_span_events: bool,
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, format: OutputFormat) -> Self {
        Self {
            level,
            format,
            ..Default::default()
        }
    }

    /// Parse a level string as used in `Settings::log_level`.
    pub fn level_from_str(level: &str) -> Result<Level, String> {
        match level.to_lowercase().as_str() {
            "trace" => Ok(Level::TRACE),
            "debug" => Ok(Level::DEBUG),
            "info" => Ok(Level::INFO),
            "warn" => Ok(Level::WARN),
            "error" => Ok(Level::ERROR),
            other => Err(format!(
                "invalid log level '{other}': expected one of trace, debug, info, warn, error"
            )),
        }
    }
}

/// Install the global `tracing` subscriber. Idempotent: a second call
/// (as happens across integration tests sharing a process) is a no-op
/// rather than an error.
pub fn init(config: LoggingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_lowercase()));
    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        OutputFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .with_ansi(config.with_ansi)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        OutputFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_span_events(span_events)
                .with_ansi(false)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
        OutputFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(layer).try_init()
        }
    };

    result.or_else(|e| {
        if e.to_string().contains("a global default trace dispatcher has already been set") {
            Ok(())
        } else {
            Err(format!("failed to initialize tracing: {e}"))
        }
    })
}
