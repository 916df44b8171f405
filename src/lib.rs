//! # fa-archiver
//!
//! Capture-and-archive pipeline for a Fast Acquisition (FA) sniffer's
//! continuous position-data stream: a single producer reads fixed-size
//! blocks off the device, an in-memory ring buffer fans them out to a
//! disk-writing transform engine and any number of live socket
//! subscribers, and a separate archive reader serves historical data
//! out of the same on-disk format.
//!
//! ## Crate structure
//!
//! - **`config`**: daemon settings, loaded from TOML plus `FA_`-prefixed
//!   environment variables.
//! - **`error`**: crate-wide `ArchiverError` and the `AppResult<T>` alias.
//! - **`logging`**: `tracing`/`tracing-subscriber` initialisation.
//! - **`validation`**: generic config-value validators.
//! - **`frame`**: the FA wire types — `Frame`, `Block`, `BpmMask`,
//!   `DecimatedRecord`.
//! - **`ring`**: the in-memory single-producer/multi-consumer ring buffer.
//! - **`device`**: the `SnifferDevice` trait plus real and dummy sources.
//! - **`transform`**: transpose/decimation engine feeding the archive writer.
//! - **`archive`**: on-disk header, index, writer, and reader.
//! - **`network`**: the ASCII line protocol and its TCP server.
//! - **`matlab`** (feature `storage_matlab`): matlab-v5 output for `fa-capture`.

pub mod archive;
pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod logging;
#[cfg(feature = "storage_matlab")]
pub mod matlab;
pub mod network;
pub mod ring;
pub mod transform;
pub mod validation;
