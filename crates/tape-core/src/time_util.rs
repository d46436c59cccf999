//! High-precision time utilities and venue timestamp parsing.
//!
//! Wall-clock timestamps use `clock_gettime(CLOCK_REALTIME)` on Linux with a
//! `SystemTime` fallback elsewhere. All market-data timestamps in this system
//! are **microseconds since Unix epoch**; venues that report milliseconds or
//! fractional seconds are converted at the parse boundary.

use crate::error::TapeError;

// ---------------------------------------------------------------------------
// Linux: use clock_gettime for maximum precision
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
#[inline]
fn clock_realtime() -> (u64, u64) {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: CLOCK_REALTIME is always valid. Failure returns -1 but the
    // zeroed ts is a safe fallback (epoch).
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    (ts.tv_sec as u64, ts.tv_nsec as u64)
}

#[cfg(target_os = "linux")]
#[inline]
fn clock_monotonic() -> (u64, u64) {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
    }
    (ts.tv_sec as u64, ts.tv_nsec as u64)
}

// ---------------------------------------------------------------------------
// Non-Linux: SystemTime / Instant fallback
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "linux"))]
#[inline]
fn clock_realtime() -> (u64, u64) {
    use std::time::{SystemTime, UNIX_EPOCH};
    let d = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (d.as_secs(), d.subsec_nanos() as u64)
}

#[cfg(not(target_os = "linux"))]
#[inline]
fn clock_monotonic() -> (u64, u64) {
    use std::{sync::LazyLock, time::Instant};
    static ORIGIN: LazyLock<Instant> = LazyLock::new(Instant::now);
    let d = ORIGIN.elapsed();
    (d.as_secs(), d.subsec_nanos() as u64)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Current wall-clock time as **microseconds** since Unix epoch.
#[inline]
pub fn now_us() -> u64 {
    let (sec, nsec) = clock_realtime();
    sec * 1_000_000 + nsec / 1_000
}

/// Monotonic clock in **milliseconds** — for elapsed-time measurements
/// without wall-clock jumps (idle watchdogs, restart pacing).
#[inline]
pub fn monotonic_ms() -> u64 {
    let (sec, nsec) = clock_monotonic();
    sec * 1_000 + nsec / 1_000_000
}

/// Parse an ISO-8601 / RFC 3339 timestamp (`2022-01-02T03:04:05.678Z`) into
/// microseconds since Unix epoch.
///
/// Used for Coinbase `matches` (fractional microseconds) and BitMEX trades
/// (fractional milliseconds); chrono normalizes both.
pub fn parse_iso_timestamp_us(iso_time: &str) -> Result<u64, TapeError> {
    let dt = chrono::DateTime::parse_from_rfc3339(iso_time)
        .map_err(|e| TapeError::Parse(format!("bad ISO timestamp '{iso_time}': {e}")))?;
    let us = dt.timestamp_micros();
    if us < 0 {
        return Err(TapeError::Parse(format!("pre-epoch timestamp '{iso_time}'")));
    }
    Ok(us as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_monotonic() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn parse_iso_millisecond_precision() {
        // BitMEX-style millisecond timestamp.
        let us = parse_iso_timestamp_us("2022-01-02T03:04:05.678Z").unwrap();
        assert_eq!(us, 1_641_092_645_678_000);
    }

    #[test]
    fn parse_iso_microsecond_precision() {
        // Coinbase-style microsecond timestamp.
        let us = parse_iso_timestamp_us("2022-01-02T03:04:05.678123Z").unwrap();
        assert_eq!(us, 1_641_092_645_678_123);
    }

    #[test]
    fn parse_iso_rejects_garbage() {
        assert!(parse_iso_timestamp_us("not a timestamp").is_err());
        assert!(parse_iso_timestamp_us("").is_err());
    }
}
