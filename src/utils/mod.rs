use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

use crate::errors::{AppError, Result};

static RELATIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s*([mhdw])$").expect("valid relative time regex"));

/// Parses a `--since` value into an absolute instant.
///
/// Accepts a window relative to `now` (`30m`, `12h`, `7d`, `2w`), a date
/// (`2024-05-01`, midnight UTC), a `YYYY-MM-DD HH:MM:SS` UTC time, or RFC 3339.
pub fn parse_since(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();

    if let Some(caps) = RELATIVE_RE.captures(input) {
        let amount: i64 = caps[1]
            .parse()
            .map_err(|_| AppError::InvalidInput(format!("'{}' is out of range", input)))?;
        let window = match &caps[2] {
            "m" => Duration::try_minutes(amount),
            "h" => Duration::try_hours(amount),
            "d" => Duration::try_days(amount),
            _ => Duration::try_weeks(amount),
        };
        return window
            .and_then(|w| now.checked_sub_signed(w))
            .ok_or_else(|| AppError::InvalidInput(format!("'{}' is out of range", input)));
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S") {
        return Ok(ts.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    Err(AppError::InvalidInput(format!(
        "cannot parse '{}': use 30m, 12h, 7d, 2w, YYYY-MM-DD or an RFC 3339 timestamp",
        input
    )))
}
