//! Clock and day/slot calendar arithmetic
//!
//! All time observed by the system flows through [`Clock`]. A logical day is
//! keyed by its local date (`YYYY-MM-DD`) and starts at the configured
//! transition hour; slot hours are logical indices 0-23 counted from that
//! boundary, so hour 0 of day `D` begins at `D` `transition_hour`:00 local.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike};
use chrono_tz::Tz;
use std::sync::Mutex;

use crate::error::{SchedError, SchedResult};

/// Hours in a logical day
pub const HOURS_PER_DAY: u8 = 24;

/// Authoritative time source in a fixed display timezone.
///
/// A frozen instant can be injected for tests; production clocks follow the
/// system clock.
#[derive(Debug)]
pub struct Clock {
    tz: Tz,
    frozen: Mutex<Option<DateTime<Tz>>>,
}

impl Clock {
    /// Create a clock following the system time in the given timezone
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            frozen: Mutex::new(None),
        }
    }

    /// Create a clock from an IANA timezone name
    pub fn from_name(name: &str) -> SchedResult<Self> {
        let tz: Tz = name
            .parse()
            .map_err(|_| SchedError::Config(format!("Unknown timezone: {}", name)))?;
        Ok(Self::new(tz))
    }

    /// Create a clock frozen at the given instant (test control)
    pub fn fixed(at: DateTime<Tz>) -> Self {
        Self {
            tz: at.timezone(),
            frozen: Mutex::new(Some(at)),
        }
    }

    /// Move a frozen clock to a new instant
    pub fn set(&self, at: DateTime<Tz>) {
        *self.frozen.lock().unwrap() = Some(at);
    }

    /// Current time in the display timezone
    pub fn now(&self) -> DateTime<Tz> {
        if let Some(at) = *self.frozen.lock().unwrap() {
            return at;
        }
        chrono::Utc::now().with_timezone(&self.tz)
    }

    /// The display timezone
    pub fn tz(&self) -> Tz {
        self.tz
    }
}

/// Resolve a local wall-clock time, stepping past DST gaps.
fn local_at(tz: Tz, date: NaiveDate, hour: u8) -> SchedResult<DateTime<Tz>> {
    let naive = date
        .and_hms_opt(hour as u32, 0, 0)
        .ok_or_else(|| SchedError::Validation(format!("Invalid hour: {}", hour)))?;
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => Ok(dt),
        chrono::LocalResult::None => {
            // Skipped by a DST jump; the boundary lands an hour later.
            let shifted = naive + Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .ok_or_else(|| SchedError::Internal(format!("Unresolvable local time {}", naive)))
        }
    }
}

/// Start of the logical day containing `t`.
///
/// If the local hour is before the transition hour we are still in the
/// previous calendar date's logical day.
pub fn day_start_for(t: &DateTime<Tz>, transition_hour: u8) -> SchedResult<DateTime<Tz>> {
    let mut date = t.date_naive();
    if t.hour() < transition_hour as u32 {
        date = date
            .pred_opt()
            .ok_or_else(|| SchedError::Internal("Date underflow".to_string()))?;
    }
    local_at(t.timezone(), date, transition_hour)
}

/// Day key (`YYYY-MM-DD`) of the logical day containing `t`
pub fn day_key_for(t: &DateTime<Tz>, transition_hour: u8) -> SchedResult<String> {
    Ok(day_start_for(t, transition_hour)?.format("%Y-%m-%d").to_string())
}

/// Parse a day key into its calendar date
pub fn parse_day_key(key: &str) -> SchedResult<NaiveDate> {
    NaiveDate::parse_from_str(key, "%Y-%m-%d")
        .map_err(|_| SchedError::Validation(format!("Invalid day key: {}", key)))
}

/// Start instant of a keyed logical day
pub fn day_start(tz: Tz, key: &str, transition_hour: u8) -> SchedResult<DateTime<Tz>> {
    local_at(tz, parse_day_key(key)?, transition_hour)
}

/// Last instant of a logical day (one second before the next boundary)
pub fn day_close(start: &DateTime<Tz>) -> DateTime<Tz> {
    *start + Duration::hours(24) - Duration::seconds(1)
}

/// Day key `offset` calendar days away from `key`
pub fn day_key_offset(key: &str, offset: i64) -> SchedResult<String> {
    let date = parse_day_key(key)? + Duration::days(offset);
    Ok(date.format("%Y-%m-%d").to_string())
}

/// Start instant of a slot hour within a keyed day
pub fn slot_start(tz: Tz, key: &str, hour: u8, transition_hour: u8) -> SchedResult<DateTime<Tz>> {
    if hour >= HOURS_PER_DAY {
        return Err(SchedError::Validation(format!("Hour out of range: {}", hour)));
    }
    Ok(day_start(tz, key, transition_hour)? + Duration::hours(hour as i64))
}

/// Truncate to the start of the wall-clock hour
pub fn hour_floor(t: &DateTime<Tz>) -> DateTime<Tz> {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(*t)
}

/// The (day key, hour index) containing `t`
pub fn current_slot(t: &DateTime<Tz>, transition_hour: u8) -> SchedResult<(String, u8)> {
    let start = day_start_for(t, transition_hour)?;
    let hour = (*t - start).num_hours().clamp(0, 23) as u8;
    Ok((start.format("%Y-%m-%d").to_string(), hour))
}

/// Render a logical hour index as a local time range, e.g. `06:00-07:00`
pub fn format_hour_range(hour: u8, transition_hour: u8) -> String {
    let start = (transition_hour as u32 + hour as u32) % 24;
    let end = (start + 1) % 24;
    format!("{:02}:00-{:02}:00", start, end)
}
