//! Line-oriented ASCII command protocol: request parsing and the
//! binary framing details (NUL success marker, gap-list encoding).
//!
//! Unlike the teacher's binary `ControlRequest`/`ControlResponse`
//! frames, every command here is one LF-terminated ASCII line; only the
//! response bodies are binary.

use crate::error::{ArchiverError, AppResult};
use crate::frame::BpmMask;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Bit position within the 4-bit `mask_bits` selector used by `D`/`DD`
/// source specs (`DF<mask_bits>`), per `spec.md` §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMask(pub u8);

impl FieldMask {
    pub const MEAN: u8 = 1 << 0;
    pub const MIN: u8 = 1 << 1;
    pub const MAX: u8 = 1 << 2;
    pub const STD: u8 = 1 << 3;

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// The three data sources a `R` (read) command may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Fa,
    D(FieldMask),
    Dd(FieldMask),
}

/// Where a historical read should start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartTime {
    pub unix_us: u64,
}

/// Parsed command. `CQ` carries no data and is handled by the caller
/// as an immediate shutdown request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `CF` — mean frame rate.
    CurrentFrequency,
    /// `CQ` — shut down.
    Quit,
    /// `CFdD` — frequency plus both decimation factors.
    CurrentFrequencyAndDecimations,
    /// `S[R<hex>|<ranges>][T]` — live subscribe.
    Subscribe { mask: BpmMask, prepend_timestamp: bool },
    /// `R...` — historical read.
    Read {
        source: Source,
        mask: BpmMask,
        start: StartTime,
        n_samples: u32,
        require_contiguous: bool,
        prepend_timestamp: bool,
        prepend_gap_list: bool,
    },
}

impl Command {
    /// Parse one command line, without the trailing LF.
    pub fn parse(line: &str) -> AppResult<Self> {
        if line == "CF" {
            return Ok(Command::CurrentFrequency);
        }
        if line == "CQ" {
            return Ok(Command::Quit);
        }
        if line == "CFdD" {
            return Ok(Command::CurrentFrequencyAndDecimations);
        }
        if let Some(rest) = line.strip_prefix('S') {
            return parse_subscribe(rest);
        }
        if let Some(rest) = line.strip_prefix('R') {
            return parse_read(rest);
        }
        Err(ArchiverError::Protocol(format!("unrecognized command: {line:?}")))
    }
}

fn parse_subscribe(rest: &str) -> AppResult<Command> {
    let (mask_part, flags) = split_trailing_flags(rest, &['T']);
    let mask = parse_mask(mask_part)?;
    Ok(Command::Subscribe {
        mask,
        prepend_timestamp: flags.contains('T'),
    })
}

/// Split `s` into a prefix and a suffix made only of characters from
/// `allowed`, so `"R<hex>T"` splits into (`"R<hex>"`, `"T"`).
fn split_trailing_flags(s: &str, allowed: &[char]) -> (&str, &str) {
    let split_at = s
        .char_indices()
        .rev()
        .take_while(|(_, c)| allowed.contains(c))
        .last()
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s.split_at(split_at)
}

fn parse_mask(s: &str) -> AppResult<BpmMask> {
    if let Some(hex) = s.strip_prefix('R') {
        BpmMask::from_hex(hex).ok_or_else(|| ArchiverError::Protocol(format!("bad raw mask: {s:?}")))
    } else {
        BpmMask::from_ranges(s).ok_or_else(|| ArchiverError::Protocol(format!("bad mask ranges: {s:?}")))
    }
}

fn parse_read(rest: &str) -> AppResult<Command> {
    let (source, rest) = parse_source(rest)?;
    let rest = rest.strip_prefix('M').ok_or_else(|| ArchiverError::Protocol("expected 'M'".into()))?;
    let (mask_str, rest) = take_mask_token(rest)?;
    let mask = parse_mask(mask_str)?;

    let (start, rest) = parse_start(rest)?;
    let rest = rest.strip_prefix('N').ok_or_else(|| ArchiverError::Protocol("expected 'N'".into()))?;
    let (n_str, rest) = take_digits(rest);
    let n_samples: u32 = n_str
        .parse()
        .map_err(|_| ArchiverError::Protocol(format!("bad sample count: {n_str:?}")))?;

    let require_contiguous = rest.contains('C');
    let prepend_timestamp = rest.contains('T');
    let prepend_gap_list = rest.contains('G');
    for c in rest.chars() {
        if !matches!(c, 'C' | 'T' | 'G') {
            return Err(ArchiverError::Protocol(format!("unexpected trailing flag: {c:?}")));
        }
    }

    Ok(Command::Read {
        source,
        mask,
        start,
        n_samples,
        require_contiguous,
        prepend_timestamp,
        prepend_gap_list,
    })
}

fn parse_source(s: &str) -> AppResult<(Source, &str)> {
    if let Some(rest) = s.strip_prefix("DD") {
        let (bits, rest) = parse_field_mask(rest)?;
        Ok((Source::Dd(bits), rest))
    } else if let Some(rest) = s.strip_prefix('D') {
        let (bits, rest) = parse_field_mask(rest)?;
        Ok((Source::D(bits), rest))
    } else if let Some(rest) = s.strip_prefix('F') {
        Ok((Source::Fa, rest))
    } else {
        Err(ArchiverError::Protocol(format!("unknown source in: {s:?}")))
    }
}

fn parse_field_mask(s: &str) -> AppResult<(FieldMask, &str)> {
    if let Some(rest) = s.strip_prefix('F') {
        let (digits, rest) = take_digits(rest);
        let bits: u8 = digits
            .parse()
            .map_err(|_| ArchiverError::Protocol(format!("bad field mask: {digits:?}")))?;
        if bits > 15 {
            return Err(ArchiverError::Protocol(format!("field mask {bits} out of range (0-15)")));
        }
        Ok((FieldMask(bits), rest))
    } else {
        Ok((FieldMask(FieldMask::MEAN | FieldMask::MIN | FieldMask::MAX | FieldMask::STD), s))
    }
}

fn take_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

/// Consume a `mask` token: either `R` followed by 64 hex chars, or a
/// decimal-range list up to (but excluding) the next `T`/`S` start marker.
fn take_mask_token(s: &str) -> AppResult<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('R') {
        if rest.len() < 64 {
            return Err(ArchiverError::Protocol("truncated raw mask".into()));
        }
        // Keep the 'R' prefix in the returned mask token ('R' + 64 hex chars).
        Ok(s.split_at(1 + 64))
    } else {
        let end = s
            .find(|c: char| c == 'T' || c == 'S')
            .ok_or_else(|| ArchiverError::Protocol("missing start time".into()))?;
        Ok(s.split_at(end))
    }
}

fn parse_start(s: &str) -> AppResult<(StartTime, &str)> {
    if let Some(rest) = s.strip_prefix('T') {
        let end = rest.find('N').ok_or_else(|| ArchiverError::Protocol("missing 'N'".into()))?;
        let (datetime_str, rest) = rest.split_at(end);
        let unix_us = parse_iso_datetime(datetime_str)?;
        Ok((StartTime { unix_us }, rest))
    } else if let Some(rest) = s.strip_prefix('S') {
        let end = rest.find('N').ok_or_else(|| ArchiverError::Protocol("missing 'N'".into()))?;
        let (secs_str, rest) = rest.split_at(end);
        let secs: f64 = secs_str
            .parse()
            .map_err(|_| ArchiverError::Protocol(format!("bad unix seconds: {secs_str:?}")))?;
        Ok((StartTime { unix_us: (secs * 1_000_000.0).round() as u64 }, rest))
    } else {
        Err(ArchiverError::Protocol("expected 'T' or 'S' start marker".into()))
    }
}

fn parse_iso_datetime(s: &str) -> AppResult<u64> {
    let dt = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|_| ArchiverError::Protocol(format!("bad ISO datetime: {s:?}")))?;
    let dt: DateTime<Utc> = Utc.from_utc_datetime(&dt);
    Ok(dt.timestamp_micros().max(0) as u64)
}

/// Encode a gap list as `u32 count` followed by `count + 1` tuples of
/// `{u32 data_index, u32 id0, u64 timestamp_us}`, per `spec.md` §4.6.
/// One tuple per discontinuity plus one trailing tuple for the final
/// run, pinning down the spec's "ambiguous" count-vs-tuple relationship.
pub fn encode_gap_list(tuples: &[(u32, u32, u64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + tuples.len() * 16);
    let count = tuples.len().saturating_sub(1) as u32;
    out.extend_from_slice(&count.to_le_bytes());
    for (data_index, id0, ts) in tuples {
        out.extend_from_slice(&data_index.to_le_bytes());
        out.extend_from_slice(&id0.to_le_bytes());
        out.extend_from_slice(&ts.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cf_cq_cfdd() {
        assert_eq!(Command::parse("CF").unwrap(), Command::CurrentFrequency);
        assert_eq!(Command::parse("CQ").unwrap(), Command::Quit);
        assert_eq!(Command::parse("CFdD").unwrap(), Command::CurrentFrequencyAndDecimations);
    }

    #[test]
    fn parses_subscribe_with_ranges_and_timestamp_flag() {
        let cmd = Command::parse("S0-3,10T").unwrap();
        match cmd {
            Command::Subscribe { mask, prepend_timestamp } => {
                assert!(prepend_timestamp);
                assert_eq!(mask.count(), 5);
            }
            _ => panic!("expected Subscribe"),
        }
    }

    #[test]
    fn parses_subscribe_with_raw_mask() {
        let mut m = BpmMask::empty();
        m.set(5);
        let line = format!("SR{}", m.to_hex());
        let cmd = Command::parse(&line).unwrap();
        match cmd {
            Command::Subscribe { mask, prepend_timestamp } => {
                assert!(!prepend_timestamp);
                assert!(mask.contains(5));
            }
            _ => panic!("expected Subscribe"),
        }
    }

    #[test]
    fn parses_historical_read_contiguous_request() {
        let mut m = BpmMask::empty();
        m.set(0);
        let line = format!("RFMR{}T2010-01-01T00:00:00N1000C", m.to_hex());
        let cmd = Command::parse(&line).unwrap();
        match cmd {
            Command::Read {
                source,
                n_samples,
                require_contiguous,
                prepend_timestamp,
                prepend_gap_list,
                ..
            } => {
                assert_eq!(source, Source::Fa);
                assert_eq!(n_samples, 1000);
                assert!(require_contiguous);
                assert!(!prepend_timestamp);
                assert!(!prepend_gap_list);
            }
            _ => panic!("expected Read"),
        }
    }

    #[test]
    fn parses_historical_read_with_gap_list_and_timestamp_flags() {
        let mut m = BpmMask::empty();
        m.set(0);
        let line = format!("RDF3MR{}S1262304000N500TG", m.to_hex());
        let cmd = Command::parse(&line).unwrap();
        match cmd {
            Command::Read { source, prepend_timestamp, prepend_gap_list, .. } => {
                assert_eq!(source, Source::D(FieldMask(3)));
                assert!(prepend_timestamp);
                assert!(prepend_gap_list);
            }
            _ => panic!("expected Read"),
        }
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(Command::parse("ZZZ").is_err());
    }

    #[test]
    fn gap_list_encodes_count_as_tuples_minus_one() {
        let tuples = [(0, 0, 0), (10, 1000, 5000)];
        let bytes = encode_gap_list(&tuples);
        let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(count, 1);
        assert_eq!(bytes.len(), 4 + 2 * 16);
    }
}
