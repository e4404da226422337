//! Cron expression parser and evaluator.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Fields: *, ?, N, A-B, */N, A-B/N, N/N, comma lists
//! Names: JAN..DEC for months, SUN..SAT for weekdays (7 is also Sunday)
//! Macros: @yearly @annually @monthly @weekly @daily @midnight @hourly
//! Example: "0 9 * * MON" = every Monday at 09:00
//!
//! Matching happens on the wall clock of the schedule's zone, so
//! "0 9 * * *" stays at 09:00 local across DST changes. When both day
//! fields are restricted a day matches if EITHER does (Vixie cron).

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use pigeon_core::error::ScheduleError;

use crate::timezone;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// How far ahead `next_after` searches before giving up.
const SEARCH_HORIZON_DAYS: i64 = 5 * 366;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid cron expression '{expression}': {reason}")]
pub struct CronError {
    pub expression: String,
    pub reason: String,
}

impl From<CronError> for ScheduleError {
    fn from(e: CronError) -> Self {
        ScheduleError::InvalidCron {
            expression: e.expression,
            reason: e.reason,
        }
    }
}

/// A parsed cron expression. Each field is a bitset of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_any: bool,
    dow_any: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let err = |reason: String| CronError {
            expression: expression.to_string(),
            reason,
        };

        let trimmed = expression.trim();
        let expanded = if trimmed.starts_with('@') {
            expand_macro(trimmed).ok_or_else(|| err(format!("unknown macro {trimmed}")))?
        } else {
            trimmed
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(err(format!(
                "need 5 fields (MIN HOUR DOM MON DOW), got {}",
                parts.len()
            )));
        }

        let minutes = parse_field(parts[0], 0, 59, &[], 0).map_err(err)?;
        let hours = parse_field(parts[1], 0, 23, &[], 0).map_err(err)?;
        let days_of_month = parse_field(parts[2], 1, 31, &[], 0).map_err(err)?;
        let months = parse_field(parts[3], 1, 12, &MONTH_NAMES, 1).map_err(err)?;
        let mut days_of_week = parse_field(parts[4], 0, 7, &DAY_NAMES, 0).map_err(err)?;
        // 7 → Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            expression: trimmed.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_any: is_wildcard(parts[2]),
            dow_any: is_wildcard(parts[4]),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        let dom = has(self.days_of_month, date.day());
        let dow = has(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_any || self.dow_any {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// First matching instant strictly after `after`, evaluated on the wall
    /// clock of `tz` (UTC when `None`). `None` if nothing matches within
    /// the search horizon (e.g. "0 0 30 2 *").
    pub fn next_after(&self, after: DateTime<Utc>, tz: Option<Tz>) -> Option<DateTime<Utc>> {
        let start = match tz {
            Some(tz) => timezone::wall_clock(tz, after),
            None => after.naive_utc(),
        };
        let horizon = start + Duration::days(SEARCH_HORIZON_DAYS);

        let mut candidate = truncate_to_minute(start)? + Duration::minutes(1);
        while candidate <= horizon {
            let date = candidate.date();
            if !has(self.months, date.month()) {
                candidate = first_of_next_month(date)?.and_time(NaiveTime::MIN);
                continue;
            }
            if !self.matches_day(date) {
                candidate = date.succ_opt()?.and_time(NaiveTime::MIN);
                continue;
            }
            if !has(self.hours, candidate.hour()) {
                candidate = date.and_hms_opt(candidate.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !has(self.minutes, candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }

            let utc = match tz {
                Some(tz) => timezone::localize(tz, candidate),
                None => candidate.and_utc(),
            };
            // Fall-back repeats can map an earlier wall time behind `after`.
            if utc > after {
                return Some(utc);
            }
            candidate += Duration::minutes(1);
        }

        None
    }
}

/// Next occurrence of `expression` after `after` in `zone`.
pub fn next_occurrence(
    expression: &str,
    after: DateTime<Utc>,
    zone: &str,
) -> Result<DateTime<Utc>, ScheduleError> {
    let tz = timezone::resolve_zone(zone)?;
    let schedule = CronSchedule::parse(expression)?;
    schedule
        .next_after(after, tz)
        .ok_or_else(|| ScheduleError::NoOccurrence(expression.to_string()))
}

/// Lenient form of [`next_occurrence`]: logs and returns `None` on error.
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>, zone: &str) -> Option<DateTime<Utc>> {
    match next_occurrence(expression, after, zone) {
        Ok(next) => Some(next),
        Err(e) => {
            tracing::warn!("⚠️ {e}");
            None
        }
    }
}

fn expand_macro(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

fn is_wildcard(field: &str) -> bool {
    field.starts_with('*') || field == "?"
}

fn has(bits: u64, value: u32) -> bool {
    bits & (1u64 << value) != 0
}

fn truncate_to_minute(t: NaiveDateTime) -> Option<NaiveDateTime> {
    t.with_second(0)?.with_nanosecond(0)
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

/// Parse one cron field into a bitset of matching values.
fn parse_field(field: &str, min: u32, max: u32, names: &[&str], name_base: u32) -> Result<u64, String> {
    let mut bits = 0u64;

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let n: u32 = step.parse().map_err(|_| format!("bad step '{step}'"))?;
                if n == 0 {
                    return Err(format!("step must be positive in '{part}'"));
                }
                (range, Some(n))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" || range == "?" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, names, name_base)?, parse_value(b, names, name_base)?)
        } else {
            let v = parse_value(range, names, name_base)?;
            // "N/step" runs from N to the end of the range
            (v, if step.is_some() { max } else { v })
        };

        if lo < min || hi > max {
            return Err(format!("'{part}' outside {min}-{max}"));
        }
        if lo > hi {
            return Err(format!("'{part}' starts after it ends"));
        }

        for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            bits |= 1u64 << v;
        }
    }

    Ok(bits)
}

fn parse_value(raw: &str, names: &[&str], name_base: u32) -> Result<u32, String> {
    if let Ok(v) = raw.parse::<u32>() {
        return Ok(v);
    }
    names
        .iter()
        .position(|n| n.eq_ignore_ascii_case(raw))
        .map(|i| i as u32 + name_base)
        .ok_or_else(|| format!("bad value '{raw}'"))
}
