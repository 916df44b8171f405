//! Crate-wide error type.
//!
//! `ArchiverError` consolidates every error surface the pipeline can hit:
//! configuration, archive IO, device IO, and per-connection protocol
//! errors. Fatal variants (archive IO, invalid header) are meant to be
//! logged and turned into a non-zero process exit; the per-connection
//! variants are rendered as the wire error line and never propagate past
//! the socket task that produced them.

use thiserror::Error;

/// Convenience alias for results using the crate's error type.
pub type AppResult<T> = std::result::Result<T, ArchiverError>;

#[derive(Error, Debug)]
pub enum ArchiverError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device error: {0}")]
    Device(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("archive header invalid: {0}")]
    InvalidHeader(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown BPM id {0} (not in archive mask)")]
    UnknownBpm(u16),

    #[error("requested timestamp is outside the archive's time range")]
    TimestampOutOfRange,

    #[error("requested run is not contiguous")]
    NotContiguous,

    #[error("reader underrun")]
    Underrun,

    #[error("read too busy")]
    ReadTooBusy,
}

impl ArchiverError {
    /// Render as the single UTF-8 line the wire protocol sends back on
    /// rejection (no trailing newline; callers append one).
    pub fn wire_message(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_has_no_trailing_newline() {
        let err = ArchiverError::UnknownBpm(300);
        assert!(!err.wire_message().ends_with('\n'));
        assert!(err.wire_message().contains("300"));
    }
}
