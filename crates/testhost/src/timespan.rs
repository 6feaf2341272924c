//! Wire format for durations.
//!
//! The test platform exchanges durations as `[d.]hh:mm:ss.fffffff`, where the
//! fraction counts 100-nanosecond ticks.

use crate::result::{TestHostError, TestHostResult};
use std::time::Duration;

const NANOS_PER_TICK: u128 = 100;
const TICKS_PER_SECOND: u128 = 10_000_000;

/// Format a duration as `[d.]hh:mm:ss.fffffff`
#[must_use]
pub fn format_timespan(duration: Duration) -> String {
    let ticks = duration.as_nanos() / NANOS_PER_TICK;
    let fraction = ticks % TICKS_PER_SECOND;
    let total_seconds = ticks / TICKS_PER_SECOND;
    let seconds = total_seconds % 60;
    let minutes = (total_seconds / 60) % 60;
    let hours = (total_seconds / 3600) % 24;
    let days = total_seconds / 86_400;

    if days > 0 {
        format!("{days}.{hours:02}:{minutes:02}:{seconds:02}.{fraction:07}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}.{fraction:07}")
    }
}

/// Parse `[d.]hh:mm:ss[.fraction]` into a duration
pub fn parse_timespan(text: &str) -> TestHostResult<Duration> {
    let invalid = || TestHostError::protocol(format!("invalid timespan: {text:?}"));

    let mut parts = text.trim().split(':');
    let (Some(head), Some(minutes), Some(tail), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };

    let (days, hours) = match head.split_once('.') {
        Some((d, h)) => (parse_unit(d).ok_or_else(invalid)?, h),
        None => (0, head),
    };
    let hours = parse_unit(hours).ok_or_else(invalid)?;
    let minutes = parse_unit(minutes).ok_or_else(invalid)?;

    let (seconds, fraction) = match tail.split_once('.') {
        Some((s, f)) => (s, f),
        None => (tail, ""),
    };
    let seconds = parse_unit(seconds).ok_or_else(invalid)?;
    if minutes >= 60 || seconds >= 60 {
        return Err(invalid());
    }

    let nanos = parse_fraction(fraction).ok_or_else(invalid)?;
    let whole = days * 86_400 + hours * 3600 + minutes * 60 + seconds;
    Ok(Duration::new(whole, nanos))
}

fn parse_unit(text: &str) -> Option<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Fraction digits beyond nanosecond precision are dropped
fn parse_fraction(text: &str) -> Option<u32> {
    if text.is_empty() {
        return Some(0);
    }
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let digits: String = text.chars().chain(std::iter::repeat('0')).take(9).collect();
    digits.parse().ok()
}

/// Serde adapter for `Duration` fields carried as timespans
pub mod serde_timespan {
    use super::{format_timespan, parse_timespan};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a duration as a timespan string
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timespan(*duration))
    }

    /// Deserialize a timespan string into a duration
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_timespan(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // =========================================================================
    // Formatting
    // =========================================================================

    #[test]
    fn test_format_zero() {
        assert_eq!(format_timespan(Duration::ZERO), "00:00:00.0000000");
    }

    #[test]
    fn test_format_millis() {
        assert_eq!(
            format_timespan(Duration::from_millis(1500)),
            "00:00:01.5000000"
        );
    }

    #[test]
    fn test_format_hours_minutes() {
        let d = Duration::from_secs(2 * 3600 + 3 * 60 + 4) + Duration::from_micros(250);
        assert_eq!(format_timespan(d), "02:03:04.0002500");
    }

    #[test]
    fn test_format_days() {
        let d = Duration::from_secs(86_400 + 3600);
        assert_eq!(format_timespan(d), "1.01:00:00.0000000");
    }

    #[test]
    fn test_format_truncates_below_tick() {
        assert_eq!(format_timespan(Duration::from_nanos(199)), "00:00:00.0000001");
    }

    // =========================================================================
    // Parsing
    // =========================================================================

    #[test]
    fn test_parse_full_precision() {
        let d = parse_timespan("00:01:02.1234567").unwrap();
        assert_eq!(d, Duration::new(62, 123_456_700));
    }

    #[test]
    fn test_parse_without_fraction() {
        assert_eq!(parse_timespan("01:00:00").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_short_fraction() {
        assert_eq!(
            parse_timespan("00:00:03.5").unwrap(),
            Duration::from_millis(3500)
        );
    }

    #[test]
    fn test_parse_days() {
        assert_eq!(
            parse_timespan("2.00:00:01").unwrap(),
            Duration::from_secs(2 * 86_400 + 1)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_timespan("").is_err());
        assert!(parse_timespan("12:30").is_err());
        assert!(parse_timespan("aa:bb:cc").is_err());
        assert!(parse_timespan("00:61:00").is_err());
        assert!(parse_timespan("00:00:00.x").is_err());
        assert!(parse_timespan("00:00:00:00").is_err());
    }

    #[test]
    fn test_parse_accepts_formatted_output() {
        let original = Duration::from_millis(93_784_005);
        let text = format_timespan(original);
        assert_eq!(parse_timespan(&text).unwrap(), original);
    }

    // =========================================================================
    // Serde adapter
    // =========================================================================

    #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
    struct Timed {
        #[serde(with = "serde_timespan")]
        elapsed: Duration,
    }

    #[test]
    fn test_serde_timespan_field() {
        let json = serde_json::to_string(&Timed {
            elapsed: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(json, r#"{"elapsed":"00:00:05.0000000"}"#);

        let back: Timed = serde_json::from_str(r#"{"elapsed":"00:00:00.25"}"#).unwrap();
        assert_eq!(back.elapsed, Duration::from_millis(250));
    }

    #[test]
    fn test_serde_timespan_rejects_invalid() {
        assert!(serde_json::from_str::<Timed>(r#"{"elapsed":"soon"}"#).is_err());
    }
}
