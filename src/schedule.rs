//! Wall-clock scheduling for the daily archival slot.

use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime};

/// The archiver's daily slot, kept away from busy logging hours.
pub const ARCHIVE_DAILY_AT: NaiveTime = match NaiveTime::from_hms_opt(3, 0, 0) {
    Some(t) => t,
    None => unreachable!(),
};

/// How long to sleep from `now` until the next occurrence of `at` on the
/// local clock.
pub fn until_next_daily(now: NaiveDateTime, at: NaiveTime) -> Duration {
    let mut target = now.date().and_time(at);
    if target <= now {
        target += chrono::Duration::days(1);
    }
    (target - now).to_std().unwrap_or_default()
}
