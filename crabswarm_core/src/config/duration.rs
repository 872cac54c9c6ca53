//! Duration strings as they appear in options documents: `"1m30s"`, `"500ms"`,
//! `"1.5s"`, `"2h"`, or a bare number of seconds.

use std::time::Duration;

use serde::Serializer;

use crate::error::ConfigError;

pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(raw.to_string());
    let input = raw.trim();
    if input.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = input.parse::<f64>() {
        return from_secs(secs).ok_or_else(invalid);
    }

    let mut total = 0.0;
    let mut rest = input;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_end == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_end].parse().map_err(|_| invalid())?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            _ => return Err(invalid()),
        };
        total += value * scale;
        rest = &rest[unit_end..];
    }
    from_secs(total).ok_or_else(invalid)
}

/// Inverse of [`parse_duration`] for whole milliseconds.
pub fn format_duration(duration: Duration) -> String {
    if duration.is_zero() {
        return "0s".to_string();
    }
    if duration < Duration::from_secs(1) {
        return format!("{}ms", duration.as_millis());
    }

    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);
    let millis = duration.subsec_millis();

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if millis > 0 {
        let fraction = format!("{}.{:03}", seconds, millis);
        out.push_str(fraction.trim_end_matches('0'));
        out.push('s');
    } else if seconds > 0 {
        out.push_str(&format!("{}s", seconds));
    }
    out
}

/// Serialize a `Duration` as fractional seconds.
pub fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// `None` for negative, non-finite or unrepresentably large values.
pub(crate) fn from_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}
