//! The time-of-day allocation schedule attached to a group.
//!
//! Grammar: a semicolon-separated list of intervals, each
//! `HH:MM-HH:MM>P1=A1:P2=A2:…` where `Pi` is a priority threshold and `Ai`
//! the amp cap for the bucket of connectors with priority >= `Pi`.
//!
//! Example:
//! `00:00-05:59>0=48;06:00-16:59>0=16:3=32:5=48;17:00-20:59>0=0:5=48;21:00-23:59>0=32:5=48`

use std::fmt;

use chrono::NaiveTime;

use crate::support::errors::ModelError;

/// One `(priority_threshold, amp_cap)` pair, in force at a given time.
pub type PriorityBucket = (i32, f64);

#[derive(Debug, Clone, PartialEq)]
struct Interval {
    start: NaiveTime,
    /// Inclusive: an interval ending 16:59 covers the whole minute.
    end: NaiveTime,
    /// Sorted by priority descending.
    buckets: Vec<PriorityBucket>,
}

/// A parsed `max_allocation` schedule. The raw text is kept verbatim for
/// CSV round-tripping and API display.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationSchedule {
    raw: String,
    intervals: Vec<Interval>,
}

impl AllocationSchedule {
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let bad = |what: &str| {
            ModelError::IllegalArgument(format!("schedule `{raw}`: {what}"))
        };

        let mut intervals = Vec::new();
        for part in raw.split(';').filter(|p| !p.trim().is_empty()) {
            let (span, values) = part
                .split_once('>')
                .ok_or_else(|| bad("missing `>` separator"))?;
            let (start, end) = span
                .split_once('-')
                .ok_or_else(|| bad("missing `-` in interval"))?;
            let start = NaiveTime::parse_from_str(start.trim(), "%H:%M")
                .map_err(|_| bad("bad start time"))?;
            let end = NaiveTime::parse_from_str(end.trim(), "%H:%M")
                .map_err(|_| bad("bad end time"))?;

            let mut buckets = Vec::new();
            for pair in values.split(':').filter(|p| !p.trim().is_empty()) {
                let (priority, amps) = pair
                    .split_once('=')
                    .ok_or_else(|| bad("missing `=` in priority pair"))?;
                let priority: i32 =
                    priority.trim().parse().map_err(|_| bad("bad priority"))?;
                let amps: f64 = amps.trim().parse().map_err(|_| bad("bad amp value"))?;
                buckets.push((priority, amps));
            }
            if buckets.is_empty() {
                return Err(bad("interval without priority pairs"));
            }
            buckets.sort_by(|a, b| b.0.cmp(&a.0));
            intervals.push(Interval { start, end, buckets });
        }

        if intervals.is_empty() {
            return Err(bad("no intervals"));
        }
        Ok(Self {
            raw: raw.to_string(),
            intervals,
        })
    }

    /// The priority buckets in force at the given wall-clock time, sorted by
    /// priority descending. `None` when no interval covers the time.
    pub fn buckets_at(&self, time_of_day: NaiveTime) -> Option<&[PriorityBucket]> {
        // End times are minute-granular and inclusive of the whole minute.
        let minute = NaiveTime::from_hms_opt(
            chrono::Timelike::hour(&time_of_day),
            chrono::Timelike::minute(&time_of_day),
            0,
        )?;
        self.intervals
            .iter()
            .find(|iv| minute >= iv.start && minute <= iv.end)
            .map(|iv| iv.buckets.as_slice())
    }

    /// Amp cap applicable to the given connector priority right now. With no
    /// priority supplied, returns the cap of the highest bucket (the
    /// absolute group ceiling).
    pub fn max_allocation_at(&self, time_of_day: NaiveTime, priority: Option<i32>) -> f64 {
        let Some(buckets) = self.buckets_at(time_of_day) else {
            return 0.0;
        };
        match priority {
            None => buckets.first().map(|(_, amps)| *amps).unwrap_or(0.0),
            Some(p) => buckets
                .iter()
                .find(|(threshold, _)| p >= *threshold)
                .map(|(_, amps)| *amps)
                .unwrap_or(0.0),
        }
    }
}

impl fmt::Display for AllocationSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: &str = "00:00-05:59>0=48;06:00-16:59>0=16:3=32:5=48;17:00-20:59>0=0:5=48;21:00-23:59>0=32:5=48";

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn parses_the_documented_example() {
        let schedule = AllocationSchedule::parse(DAY).unwrap();

        let night = schedule.buckets_at(at(3, 30)).unwrap();
        assert_eq!(night, &[(0, 48.0)]);

        let day = schedule.buckets_at(at(12, 0)).unwrap();
        assert_eq!(day, &[(5, 48.0), (3, 32.0), (0, 16.0)]);
    }

    #[test]
    fn end_minute_is_inclusive() {
        let schedule = AllocationSchedule::parse(DAY).unwrap();
        // 16:59:45 still belongs to the 06:00-16:59 interval.
        let t = NaiveTime::from_hms_opt(16, 59, 45).unwrap();
        assert_eq!(schedule.buckets_at(t).unwrap()[2], (0, 16.0));
        assert_eq!(schedule.buckets_at(at(17, 0)).unwrap(), &[(5, 48.0), (0, 0.0)]);
    }

    #[test]
    fn max_allocation_by_priority() {
        let schedule = AllocationSchedule::parse(DAY).unwrap();
        // Ceiling (no priority) is the highest bucket's cap.
        assert_eq!(schedule.max_allocation_at(at(12, 0), None), 48.0);
        // A priority-3 connector lands in the 3=32 bucket.
        assert_eq!(schedule.max_allocation_at(at(12, 0), Some(3)), 32.0);
        assert_eq!(schedule.max_allocation_at(at(12, 0), Some(4)), 32.0);
        assert_eq!(schedule.max_allocation_at(at(12, 0), Some(0)), 16.0);
        assert_eq!(schedule.max_allocation_at(at(12, 0), Some(9)), 48.0);
        // Negative priority falls below every bucket.
        assert_eq!(schedule.max_allocation_at(at(12, 0), Some(-1)), 0.0);
    }

    #[test]
    fn gap_in_coverage_yields_none() {
        let schedule = AllocationSchedule::parse("08:00-17:59>0=32").unwrap();
        assert!(schedule.buckets_at(at(7, 59)).is_none());
        assert!(schedule.buckets_at(at(8, 0)).is_some());
        assert!(schedule.buckets_at(at(18, 0)).is_none());
    }

    #[test]
    fn rejects_malformed_schedules() {
        for bad in [
            "",
            "garbage",
            "00:00-23:59",
            "00:00-23:59>",
            "00:00-23:59>x=1",
            "25:00-23:59>0=48",
        ] {
            assert!(AllocationSchedule::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn display_round_trips_the_raw_text() {
        let schedule = AllocationSchedule::parse(DAY).unwrap();
        assert_eq!(schedule.to_string(), DAY);
    }
}
