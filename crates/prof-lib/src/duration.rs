//! Duration strings in the `1h2m3.5s` form the worker parses

use crate::error::{ProfError, Result};
use std::time::Duration;

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SEC: u128 = 1_000_000_000;
const NANOS_PER_MIN: u128 = 60 * NANOS_PER_SEC;
const NANOS_PER_HOUR: u128 = 60 * NANOS_PER_MIN;

/// Render a duration the way the worker expects it on its command line.
///
/// Sub-second values use the largest unit that keeps an integer part
/// (`500ms`, `1.5ms`), longer values are spelled out in hours, minutes and
/// seconds (`1m0s`, `1h0m0s`, `2m3.5s`).
pub fn format(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < NANOS_PER_MICRO {
        return format!("{nanos}ns");
    }
    if nanos < NANOS_PER_MILLI {
        return format!("{}µs", fraction(nanos, NANOS_PER_MICRO, 3));
    }
    if nanos < NANOS_PER_SEC {
        return format!("{}ms", fraction(nanos, NANOS_PER_MILLI, 6));
    }

    let hours = nanos / NANOS_PER_HOUR;
    let minutes = (nanos % NANOS_PER_HOUR) / NANOS_PER_MIN;
    let seconds = fraction(nanos % NANOS_PER_MIN, NANOS_PER_SEC, 9);

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn fraction(value: u128, unit: u128, digits: usize) -> String {
    let whole = value / unit;
    let rem = value % unit;
    if rem == 0 {
        return whole.to_string();
    }
    let decimals = format!("{rem:0digits$}");
    format!("{whole}.{}", decimals.trim_end_matches('0'))
}

/// Parse a duration such as `30s`, `5m`, `1m30s`, `1.5h` or `250ms`.
///
/// A bare `0` is accepted; any other number needs a unit.
pub fn parse(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(ProfError::invalid("empty duration"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let invalid = || ProfError::invalid(format!("invalid duration {input:?}"));
    let mut total: f64 = 0.0;
    let mut rest = s;

    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| ProfError::invalid(format!("missing unit in duration {input:?}")))?;
        if num_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => NANOS_PER_MICRO as f64,
            "ms" => NANOS_PER_MILLI as f64,
            "s" => NANOS_PER_SEC as f64,
            "m" => NANOS_PER_MIN as f64,
            "h" => NANOS_PER_HOUR as f64,
            unit => {
                return Err(ProfError::invalid(format!(
                    "unknown unit {unit:?} in duration {input:?}"
                )))
            }
        };
        total += value * nanos_per_unit;
        rest = &rest[unit_len..];
    }

    Ok(Duration::from_nanos(total.round() as u64))
}
