//! Next-fire computation for each schedule kind.
//!
//! [`next_fire`] is pure and total: malformed input or arithmetic overflow
//! yields a one-hour fallback instead of an error, because a scheduling gap
//! is worse than an off-cadence retry.

use chrono::{DateTime, Duration, NaiveTime, Utc};

use polibot_types::ScheduleKind;

/// Default minute interval when the configured value is absent or invalid.
/// A deliberate default, not an error path.
pub const DEFAULT_MINUTE_INTERVAL: u32 = 5;

fn fallback(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::hours(1)
}

/// Parse an "HH:MM" time of day.
pub fn parse_time_of_day(text: &str) -> Option<NaiveTime> {
    let (hour, minute) = text.trim().split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Compute the next fire instant for `kind` relative to `now`.
pub fn next_fire(kind: &ScheduleKind, now: DateTime<Utc>) -> DateTime<Utc> {
    let computed = match kind {
        ScheduleKind::Daily { time_of_day } => {
            let Some(time) = parse_time_of_day(time_of_day) else {
                return fallback(now);
            };
            let today_at = now.date_naive().and_time(time).and_utc();
            if today_at > now {
                Some(today_at)
            } else {
                today_at.checked_add_signed(Duration::days(1))
            }
        }
        ScheduleKind::Hourly { interval_hours } => {
            if *interval_hours < 1 {
                return fallback(now);
            }
            now.checked_add_signed(Duration::hours(*interval_hours as i64))
        }
        ScheduleKind::Minute { interval_minutes } => {
            let minutes = interval_minutes
                .filter(|m| *m >= 1)
                .unwrap_or(DEFAULT_MINUTE_INTERVAL);
            now.checked_add_signed(Duration::minutes(minutes as i64))
        }
    };
    computed.unwrap_or_else(|| fallback(now))
}

/// Validate schedule parameters for rule creation and update.
///
/// An absent minute interval is accepted (the documented default applies);
/// everything else invalid is rejected.
pub fn validate_schedule(kind: &ScheduleKind) -> Result<(), String> {
    match kind {
        ScheduleKind::Daily { time_of_day } => {
            if parse_time_of_day(time_of_day).is_none() {
                return Err(format!("time of day must be \"HH:MM\", got {time_of_day:?}"));
            }
        }
        ScheduleKind::Hourly { interval_hours } => {
            if *interval_hours < 1 {
                return Err("hour interval must be at least 1".into());
            }
        }
        ScheduleKind::Minute {
            interval_minutes: Some(m),
        } if *m < 1 => {
            return Err("minute interval must be at least 1".into());
        }
        ScheduleKind::Minute { .. } => {}
    }
    Ok(())
}
