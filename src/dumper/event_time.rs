//! Event-time extraction from raw log content.

use std::sync::LazyLock;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use regex::Regex;

/// A date, optionally followed by a time and fractional seconds, anywhere
/// near the front of the record.
static TIMESTAMP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4}-\d{2}-\d{2})(?:[\sT](\d{2}:\d{2}:\d{2})(?:\.(\d{1,9}))?)?")
        .expect("timestamp pattern must compile")
});

/// Extract the event time of a record as local-epoch milliseconds.
///
/// Tries the generic timestamp pattern first, then a leading run of ten
/// digits read as UNIX seconds. Returns `None` when the record carries no
/// recognizable time; the caller falls back to the wall clock.
pub fn extract_event_time_ms(content: &str) -> Option<i64> {
    if let Some(captures) = TIMESTAMP_PATTERN.captures(content) {
        let date = NaiveDate::parse_from_str(&captures[1], "%Y-%m-%d").ok()?;
        let time = match captures.get(2) {
            Some(t) => NaiveTime::parse_from_str(t.as_str(), "%H:%M:%S").ok()?,
            None => NaiveTime::MIN,
        };
        let mut datetime = NaiveDateTime::new(date, time);
        if let Some(fraction) = captures.get(3) {
            let digits = fraction.as_str();
            let nanos: u32 = digits.parse::<u32>().ok()? * 10u32.pow(9 - digits.len() as u32);
            datetime = datetime + chrono::Duration::nanoseconds(nanos as i64);
        }
        return Local
            .from_local_datetime(&datetime)
            .earliest()
            .map(|dt| dt.timestamp_millis());
    }

    // Some applications log a bare epoch at the front of every line.
    let leading = content.as_bytes().get(..10)?;
    if content.len() > 10 && leading.iter().all(u8::is_ascii_digit) {
        let seconds: i64 = content[..10].parse().ok()?;
        return Some(seconds * 1000);
    }

    None
}
