//! Matlab-v5 container packaging for the capture client.
//!
//! Only `fa-capture`'s `-M` flag needs this; everything else in the
//! crate treats it as pure output formatting, grounded on the
//! teacher's `storage_matlab`-gated writer in `data/storage_factory.rs`
//! (feature-flagged, `matrw` behind `storage_matlab`). This module is
//! itself compiled only under that feature.

use crate::error::{ArchiverError, AppResult};
use crate::frame::Point;
use matrw::MatFile;
use std::path::Path;

/// Days between Matlab's `datenum` epoch (year 0, day 0) and the Unix
/// epoch (1970-01-01).
const MATLAB_UNIX_EPOCH_OFFSET_DAYS: f64 = 719_529.0;

/// Convert a Unix microsecond timestamp to a Matlab `datenum` (days,
/// fractional part for time-of-day).
pub fn unix_us_to_matlab_datenum(unix_us: u64) -> f64 {
    let days = unix_us as f64 / 1_000_000.0 / 86_400.0;
    MATLAB_UNIX_EPOCH_OFFSET_DAYS + days
}

/// Inverse of [`unix_us_to_matlab_datenum`], rounded to the nearest
/// microsecond.
pub fn matlab_datenum_to_unix_us(datenum: f64) -> u64 {
    ((datenum - MATLAB_UNIX_EPOCH_OFFSET_DAYS) * 86_400.0 * 1_000_000.0).round() as u64
}

/// Write one capture run to a matlab-v5 `.mat` file: a `data` variable
/// of shape `[2, n_bpms, n_samples]` (X/Y, BPM, sample, Matlab's
/// column-major order) and a `timestamp` scalar holding the first
/// sample's Matlab datenum.
///
/// `columns[i]` is BPM `i`'s samples in time order; every column must
/// have the same length.
pub fn write_capture(path: &Path, columns: &[Vec<Point>], first_sample_unix_us: u64) -> AppResult<()> {
    let n_bpms = columns.len();
    let n_samples = columns.first().map_or(0, |c| c.len());
    if columns.iter().any(|c| c.len() != n_samples) {
        return Err(ArchiverError::Archive("capture columns have mismatched lengths".into()));
    }

    // Column-major: fastest-varying dimension first (channel), then
    // BPM, then sample.
    let mut data = Vec::with_capacity(2 * n_bpms * n_samples);
    for sample in 0..n_samples {
        for bpm in 0..n_bpms {
            data.push(columns[bpm][sample].x as f64);
            data.push(columns[bpm][sample].y as f64);
        }
    }

    let mut file = MatFile::create(path)
        .map_err(|e| ArchiverError::Archive(format!("could not create matlab container: {e}")))?;
    file.write_matrix("data", &[2, n_bpms, n_samples], &data)
        .map_err(|e| ArchiverError::Archive(format!("writing 'data' variable: {e}")))?;
    file.write_matrix("timestamp", &[1, 1], &[unix_us_to_matlab_datenum(first_sample_unix_us)])
        .map_err(|e| ArchiverError::Archive(format!("writing 'timestamp' variable: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datenum_round_trip_is_monotone_to_ms_precision() {
        let a = 1_700_000_000_000_000u64;
        let b = a + 500_000;
        let da = unix_us_to_matlab_datenum(a);
        let db = unix_us_to_matlab_datenum(b);
        assert!(db > da);

        let back = matlab_datenum_to_unix_us(da);
        assert!((back as i64 - a as i64).abs() <= 1_000);
    }

    #[test]
    fn unix_epoch_maps_to_known_datenum() {
        // 1970-01-01 00:00:00 UTC is datenum 719529 exactly.
        assert_eq!(unix_us_to_matlab_datenum(0), MATLAB_UNIX_EPOCH_OFFSET_DAYS);
    }
}
