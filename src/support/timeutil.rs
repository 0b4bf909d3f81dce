//! Time formatting helpers and the top-of-hour alignment used by the
//! engine's delayed-retry logic.

use chrono::{DateTime, Local, TimeZone, Utc};

/// Local wall-clock rendering used in logs and the sessions CSV.
pub fn time_str(t: DateTime<Utc>) -> String {
    t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Local time-of-day rendering used for charging-history entries.
pub fn clock_str(t: DateTime<Utc>) -> String {
    t.with_timezone(&Local).format("%H:%M:%S").to_string()
}

/// `[H]HH:MM:SS` duration rendering. Hours may exceed two digits.
pub fn duration_str(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds % 60)
}

/// Returns the timestamp `interval/2` seconds before the next top of the
/// hour after `t`. A timestamp already on the hour counts as its own top.
pub fn next_top_of_hour(t: DateTime<Utc>, interval: i64) -> DateTime<Utc> {
    let secs = t.timestamp();
    let next_hour = secs.div_euclid(3600) * 3600
        + if secs.rem_euclid(3600) == 0 { 0 } else { 3600 };
    match Utc.timestamp_opt(next_hour - interval / 2, 0) {
        chrono::LocalResult::Single(dt) => dt,
        _ => t,
    }
}
