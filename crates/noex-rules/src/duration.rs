//! Duration grammar shared by timers, temporal windows, and lookup caches.
//!
//! A duration is either a bare non-negative number of milliseconds or a
//! string of the form `"Ns"`, `"Nm"`, `"Nh"`, `"Nd"` with a positive
//! integer N. Anything else fails closed with a validation error.

use crate::error::{Result, RuleError};
use chrono::Duration;
use serde_json::Value;

/// Parse a duration string such as `"5s"`, `"10m"`, `"1h"`, or `"2d"`.
pub fn parse_duration_str(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(RuleError::validation("duration must not be empty"));
    }

    // A bare integer string is milliseconds.
    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        let ms: i64 = trimmed
            .parse()
            .map_err(|_| RuleError::validation(format!("invalid duration: {trimmed}")))?;
        return Ok(Duration::milliseconds(ms));
    }

    let (number, unit) = trimmed.split_at(trimmed.len() - 1);
    let quantity: i64 = number
        .parse()
        .map_err(|_| RuleError::validation(format!("invalid duration: {trimmed}")))?;
    if quantity <= 0 {
        return Err(RuleError::validation(format!(
            "duration must be positive: {trimmed}"
        )));
    }

    match unit {
        "s" => Ok(Duration::seconds(quantity)),
        "m" => Ok(Duration::minutes(quantity)),
        "h" => Ok(Duration::hours(quantity)),
        "d" => Ok(Duration::days(quantity)),
        _ => Err(RuleError::validation(format!(
            "unknown duration unit: {trimmed}"
        ))),
    }
}

/// Parse a duration from a JSON value: a number of milliseconds or a
/// duration string.
pub fn parse_duration(value: &Value) -> Result<Duration> {
    match value {
        Value::Number(n) => {
            let ms = n
                .as_i64()
                .ok_or_else(|| RuleError::validation(format!("invalid duration: {n}")))?;
            if ms < 0 {
                return Err(RuleError::validation(format!(
                    "duration must not be negative: {ms}"
                )));
            }
            Ok(Duration::milliseconds(ms))
        }
        Value::String(s) => parse_duration_str(s),
        other => Err(RuleError::validation(format!(
            "duration must be a number or string, got {other}"
        ))),
    }
}

/// Convert a parsed duration to a std duration for tokio sleeps.
///
/// Durations are validated non-negative at parse time.
pub fn to_std(duration: Duration) -> std::time::Duration {
    duration.to_std().unwrap_or(std::time::Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration_str("5s").unwrap(), Duration::seconds(5));
        assert_eq!(parse_duration_str("10m").unwrap(), Duration::minutes(10));
        assert_eq!(parse_duration_str("1h").unwrap(), Duration::hours(1));
        assert_eq!(parse_duration_str("2d").unwrap(), Duration::days(2));
    }

    #[test]
    fn test_bare_number_is_milliseconds() {
        assert_eq!(
            parse_duration(&json!(1500)).unwrap(),
            Duration::milliseconds(1500)
        );
        assert_eq!(
            parse_duration_str("250").unwrap(),
            Duration::milliseconds(250)
        );
    }

    #[test]
    fn test_malformed_durations_fail_closed() {
        assert!(parse_duration_str("").is_err());
        assert!(parse_duration_str("5x").is_err());
        assert!(parse_duration_str("-5s").is_err());
        assert!(parse_duration_str("0m").is_err());
        assert!(parse_duration_str("s").is_err());
        assert!(parse_duration(&json!(-10)).is_err());
        assert!(parse_duration(&json!(true)).is_err());
        assert!(parse_duration(&json!(1.5)).is_err());
    }
}
