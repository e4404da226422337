//! Local ↔ UTC conversion for schedule authoring zones.
//!
//! Zones are IANA identifiers resolved through `chrono-tz`. `"UTC"` and the
//! empty string are identity. Two flavours are offered:
//! - `to_utc` / `from_utc` return a [`ScheduleError`] for unknown zones;
//! - `convert_to_utc` / `convert_from_utc` hand the input back unchanged.
//!
//! DST: an ambiguous wall-clock time (fall back) resolves to the earlier
//! instant; a time inside a spring-forward gap is pushed forward by the gap.

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use pigeon_core::error::ScheduleError;

/// Whether `zone` means plain UTC.
pub fn is_utc(zone: &str) -> bool {
    let zone = zone.trim();
    zone.is_empty() || zone.eq_ignore_ascii_case("UTC")
}

/// Resolve an IANA zone id. `Ok(None)` means UTC.
pub fn resolve_zone(zone: &str) -> Result<Option<Tz>, ScheduleError> {
    if is_utc(zone) {
        return Ok(None);
    }
    zone.trim()
        .parse::<Tz>()
        .map(Some)
        .map_err(|_| ScheduleError::UnknownTimeZone(zone.to_string()))
}

/// Interpret a wall-clock time in `tz`.
pub fn localize(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            // Gap: apply the offset in force before the transition, which
            // lands the same distance past the gap.
            let before = tz
                .offset_from_utc_datetime(&(local - Duration::days(1)))
                .fix()
                .local_minus_utc();
            (local - Duration::seconds(i64::from(before))).and_utc()
        }
    }
}

/// Wall-clock time of `utc` in `tz`.
pub fn wall_clock(tz: Tz, utc: DateTime<Utc>) -> NaiveDateTime {
    utc.with_timezone(&tz).naive_local()
}

/// Convert a local wall-clock time in `zone` to UTC.
pub fn to_utc(local: NaiveDateTime, zone: &str) -> Result<DateTime<Utc>, ScheduleError> {
    Ok(match resolve_zone(zone)? {
        Some(tz) => localize(tz, local),
        None => local.and_utc(),
    })
}

/// Convert a UTC instant to wall-clock time in `zone`.
pub fn from_utc(utc: DateTime<Utc>, zone: &str) -> Result<NaiveDateTime, ScheduleError> {
    Ok(match resolve_zone(zone)? {
        Some(tz) => wall_clock(tz, utc),
        None => utc.naive_utc(),
    })
}

/// Like [`to_utc`], but an unknown zone returns the input unchanged
/// (reinterpreted as UTC). Callers must not assume a conversion happened.
pub fn convert_to_utc(local: NaiveDateTime, zone: &str) -> DateTime<Utc> {
    to_utc(local, zone).unwrap_or_else(|e| {
        tracing::warn!("⚠️ {e}; keeping {local} unconverted");
        local.and_utc()
    })
}

/// Like [`from_utc`], but an unknown zone returns the input unchanged.
pub fn convert_from_utc(utc: DateTime<Utc>, zone: &str) -> NaiveDateTime {
    from_utc(utc, zone).unwrap_or_else(|e| {
        tracing::warn!("⚠️ {e}; keeping {utc} unconverted");
        utc.naive_utc()
    })
}
