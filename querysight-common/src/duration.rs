//! Prometheus-style duration strings.
//!
//! Durations are written as a sequence of `<number><unit>` pairs with units
//! in strictly decreasing order: `y`, `w`, `d`, `h`, `m`, `s`, `ms`
//! (e.g. `"10s"`, `"1m30s"`, `"500ms"`). The literal `"0"` is also accepted.
//!
//! The module doubles as a serde adapter:
//!
//! ```ignore
//! #[derive(Deserialize)]
//! struct Global {
//!     #[serde(with = "querysight_common::duration")]
//!     scrape_timeout: Duration,
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

use crate::error::{Error, Result};

const UNITS: [(&str, u64); 7] = [
    ("y", 365 * 24 * 60 * 60 * 1000),
    ("w", 7 * 24 * 60 * 60 * 1000),
    ("d", 24 * 60 * 60 * 1000),
    ("h", 60 * 60 * 1000),
    ("m", 60 * 1000),
    ("s", 1000),
    ("ms", 1),
];

/// Parse a Prometheus-style duration string.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::duration(input, "empty duration string"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut rest = s;
    let mut total_ms: u64 = 0;
    // Index into UNITS of the last unit seen; units must strictly decrease.
    let mut last_unit: Option<usize> = None;

    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(Error::duration(input, "expected a number"));
        }
        let (number, tail) = rest.split_at(digits);
        let value: u64 = number
            .parse()
            .map_err(|_| Error::duration(input, "number out of range"))?;

        // "ms" must be tried before "m".
        let unit_idx = if tail.starts_with("ms") {
            6
        } else {
            match UNITS[..6]
                .iter()
                .position(|(unit, _)| tail.starts_with(unit))
            {
                Some(idx) => idx,
                None => return Err(Error::duration(input, "unknown or missing unit")),
            }
        };

        if let Some(last) = last_unit
            && unit_idx <= last
        {
            return Err(Error::duration(input, "units out of order"));
        }
        last_unit = Some(unit_idx);

        let (unit, factor) = UNITS[unit_idx];
        total_ms = value
            .checked_mul(factor)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| Error::duration(input, "duration out of range"))?;
        rest = &tail[unit.len()..];
    }

    Ok(Duration::from_millis(total_ms))
}

/// Format a duration the way [`parse_duration`] reads it back.
///
/// Sub-millisecond precision is dropped.
pub fn format_duration(duration: Duration) -> String {
    let mut ms = duration.as_millis() as u64;
    if ms == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (unit, factor) in UNITS {
        if ms >= factor {
            out.push_str(&format!("{}{}", ms / factor, unit));
            ms %= factor;
        }
    }
    out
}

/// Serialize a duration as a Prometheus-style string.
pub fn serialize<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(*duration))
}

/// Deserialize a duration from a Prometheus-style string.
pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Duration, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}
