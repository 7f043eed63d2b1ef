//! Cadence kinds and next-run computation.
//!
//! Two families: relative intervals advance from the *completion* time of
//! the previous run (so backpressure never accumulates drift), while
//! fixed-wall-clock cadences (daily, weekly) always compute the next
//! absolute instant regardless of how long the prior run took.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// The rule determining a job's next scheduled execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cadence {
    /// Run every `secs` seconds, measured from run completion.
    Interval { secs: u64 },
    /// Run daily at the given UTC wall-clock time.
    Daily { hour: u32, minute: u32 },
    /// Run weekly on the given day at the given UTC wall-clock time.
    Weekly {
        weekday: Weekday,
        hour: u32,
        minute: u32,
    },
    /// Run once; no reschedule after completion.
    Once,
}

impl Cadence {
    /// Next scheduled instant strictly after `completed`.
    ///
    /// Returns `None` for one-shot cadences.
    pub fn next_after(&self, completed: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Cadence::Interval { secs } => Some(completed + Duration::seconds(secs as i64)),
            Cadence::Daily { hour, minute } => {
                let today = at_wall_clock(completed, hour, minute);
                if today > completed {
                    Some(today)
                } else {
                    Some(today + Duration::days(1))
                }
            }
            Cadence::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let days_ahead = (weekday.num_days_from_monday() as i64
                    - completed.weekday().num_days_from_monday() as i64)
                    .rem_euclid(7);
                let candidate = at_wall_clock(completed + Duration::days(days_ahead), hour, minute);
                if candidate > completed {
                    Some(candidate)
                } else {
                    Some(candidate + Duration::days(7))
                }
            }
            Cadence::Once => None,
        }
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cadence::Interval { secs } => write!(f, "every {secs}s"),
            Cadence::Daily { hour, minute } => write!(f, "daily at {hour:02}:{minute:02}"),
            Cadence::Weekly {
                weekday,
                hour,
                minute,
            } => write!(f, "weekly {weekday} {hour:02}:{minute:02}"),
            Cadence::Once => write!(f, "once"),
        }
    }
}

fn at_wall_clock(day: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(day.year(), day.month(), day.day(), hour, minute, 0)
        .single()
        .unwrap_or(day)
}
