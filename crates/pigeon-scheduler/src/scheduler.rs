//! Scheduler — creates, cancels, and reschedules scheduled notifications
//! and works out when each one fires next.
//!
//! Times come in as local wall-clock values plus an IANA zone and are
//! stored in UTC. The zone is kept on the schedule so reschedules and
//! recurrence math reuse it.
//!
//! By default scheduling problems degrade (bad zone → unconverted time,
//! bad cron → no next execution) with a warning. `strict` turns them into
//! errors instead.

use std::sync::Arc;

use chrono::{DateTime, Days, Months, NaiveDateTime, Utc};
use pigeon_core::config::SchedulerConfig;
use pigeon_core::error::{Result, ScheduleError};
use pigeon_core::traits::{Clock, ScheduleRepository};
use pigeon_core::types::{
    NotificationPayload, RecurrencePattern, ScheduleStatus, ScheduledNotification,
};

use crate::{cron, timezone};

/// Result of [`Scheduler::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    /// The schedule was already cancelled or completed; nothing written.
    AlreadyTerminal(ScheduleStatus),
}

impl CancelOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CancelOutcome::Cancelled)
    }
}

pub struct Scheduler {
    schedules: Arc<dyn ScheduleRepository>,
    clock: Arc<dyn Clock>,
    strict: bool,
}

impl Scheduler {
    pub fn new(schedules: Arc<dyn ScheduleRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            schedules,
            clock,
            strict: false,
        }
    }

    pub fn from_config(
        schedules: Arc<dyn ScheduleRepository>,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> Self {
        Self::new(schedules, clock).with_strict(config.strict)
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    fn local_to_utc(&self, local: NaiveDateTime, zone: &str) -> Result<DateTime<Utc>> {
        if self.strict {
            Ok(timezone::to_utc(local, zone)?)
        } else {
            Ok(timezone::convert_to_utc(local, zone))
        }
    }

    fn resolve_next(&self, schedule: &ScheduledNotification) -> Result<Option<DateTime<Utc>>> {
        if self.strict {
            Ok(calculate_next_execution(schedule)?)
        } else {
            Ok(next_execution_lenient(schedule))
        }
    }

    /// Schedule a single delivery at `scheduled_for_local` in `time_zone`.
    pub async fn schedule_one_time(
        &self,
        payload: NotificationPayload,
        scheduled_for_local: NaiveDateTime,
        time_zone: &str,
        created_by: &str,
    ) -> Result<ScheduledNotification> {
        let scheduled_for = self.local_to_utc(scheduled_for_local, time_zone)?;
        let schedule = ScheduledNotification::one_time(
            payload,
            scheduled_for,
            time_zone,
            created_by,
            self.clock.now(),
        );
        self.schedules.add(&schedule).await?;
        tracing::info!(
            "📅 Schedule added: {} at {} ({})",
            schedule.id,
            scheduled_for,
            time_zone
        );
        Ok(schedule)
    }

    /// Schedule a calendar recurrence starting at `first_execution_local`.
    /// Cron schedules go through [`Scheduler::schedule_with_cron`].
    pub async fn schedule_recurring(
        &self,
        payload: NotificationPayload,
        first_execution_local: NaiveDateTime,
        pattern: RecurrencePattern,
        time_zone: &str,
        max_executions: Option<u32>,
        created_by: &str,
    ) -> Result<ScheduledNotification> {
        if pattern == RecurrencePattern::Cron {
            return Err(ScheduleError::InvalidPattern(
                "cron schedules need an expression; use schedule_with_cron".into(),
            )
            .into());
        }

        let first = self.local_to_utc(first_execution_local, time_zone)?;
        let mut schedule = ScheduledNotification::recurring(
            payload,
            first,
            pattern,
            time_zone,
            max_executions,
            created_by,
            self.clock.now(),
        );
        schedule.next_execution = Some(first);
        self.schedules.add(&schedule).await?;
        tracing::info!(
            "📅 Recurring schedule added: {} ({}) first at {}",
            schedule.id,
            pattern.as_str(),
            first
        );
        Ok(schedule)
    }

    /// Schedule by cron expression, evaluated on the wall clock of `time_zone`.
    pub async fn schedule_with_cron(
        &self,
        payload: NotificationPayload,
        cron_expression: &str,
        time_zone: &str,
        max_executions: Option<u32>,
        created_by: &str,
    ) -> Result<ScheduledNotification> {
        let now = self.clock.now();
        let next = match cron::next_occurrence(cron_expression, now, time_zone) {
            Ok(next) => Some(next),
            Err(e) if !self.strict => {
                tracing::warn!("⚠️ Cron schedule saved without a next execution: {e}");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let mut schedule = ScheduledNotification::recurring(
            payload,
            next.unwrap_or(now),
            RecurrencePattern::Cron,
            time_zone,
            max_executions,
            created_by,
            now,
        );
        schedule.cron_expression = Some(cron_expression.trim().to_string());
        schedule.next_execution = next;
        self.schedules.add(&schedule).await?;
        tracing::info!(
            "📅 Cron schedule added: {} '{}' ({}) next {:?}",
            schedule.id,
            cron_expression,
            time_zone,
            next
        );
        Ok(schedule)
    }

    pub async fn cancel(
        &self,
        schedule_id: &str,
        reason: &str,
        cancelled_by: &str,
    ) -> Result<CancelOutcome> {
        let Some(mut schedule) = self.schedules.get_by_id(schedule_id).await? else {
            tracing::warn!("⚠️ Cancel: schedule {schedule_id} not found");
            return Ok(CancelOutcome::NotFound);
        };
        if !schedule.is_active() {
            tracing::info!(
                "Schedule {schedule_id} already {}, not cancelling",
                schedule.status.as_str()
            );
            return Ok(CancelOutcome::AlreadyTerminal(schedule.status));
        }

        schedule.status = ScheduleStatus::Cancelled;
        schedule.cancel_reason = Some(reason.to_string());
        schedule.cancelled_by = Some(cancelled_by.to_string());
        schedule.next_execution = None;
        schedule.updated_at = self.clock.now();
        self.schedules.update(&schedule).await?;
        tracing::info!("🚫 Schedule cancelled: {schedule_id} by {cancelled_by} ({reason})");
        Ok(CancelOutcome::Cancelled)
    }

    /// Move a schedule to a new local time in its stored zone.
    /// Cancelled and completed schedules come back unchanged.
    pub async fn reschedule(
        &self,
        schedule_id: &str,
        new_scheduled_for_local: NaiveDateTime,
    ) -> Result<Option<ScheduledNotification>> {
        let Some(mut schedule) = self.schedules.get_by_id(schedule_id).await? else {
            tracing::warn!("⚠️ Reschedule: schedule {schedule_id} not found");
            return Ok(None);
        };
        if !schedule.is_active() {
            tracing::info!(
                "Schedule {schedule_id} is {}, leaving it as is",
                schedule.status.as_str()
            );
            return Ok(Some(schedule));
        }

        let scheduled_for = self.local_to_utc(new_scheduled_for_local, &schedule.time_zone)?;
        schedule.scheduled_for = scheduled_for;
        schedule.next_execution = Some(scheduled_for);
        schedule.updated_at = self.clock.now();
        self.schedules.update(&schedule).await?;
        tracing::info!("🔁 Schedule {schedule_id} moved to {scheduled_for}");
        Ok(Some(schedule))
    }

    /// Record that `fired_at` (the occurrence just materialized, normally
    /// the schedule's `next_execution`) has fired, and advance the schedule.
    ///
    /// Cron schedules never come back with a `next_execution` in the past:
    /// occurrences missed while nothing was firing are skipped and the next
    /// one after the clock's `now` is used. Calendar patterns advance one
    /// period per fire.
    pub async fn record_execution(
        &self,
        schedule_id: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<Option<ScheduledNotification>> {
        let Some(mut schedule) = self.schedules.get_by_id(schedule_id).await? else {
            return Ok(None);
        };
        if !schedule.is_active() {
            tracing::debug!(
                "Ignoring fire of {} schedule {schedule_id}",
                schedule.status.as_str()
            );
            return Ok(Some(schedule));
        }

        let now = self.clock.now();
        schedule.last_execution = Some(fired_at);
        schedule.execution_count += 1;
        schedule.updated_at = now;
        schedule.next_execution = if schedule.max_reached() {
            None
        } else {
            self.resolve_next(&schedule)?
        };
        if schedule.is_cron() && schedule.next_execution.is_some_and(|next| next <= now) {
            let mut from_now = schedule.clone();
            from_now.last_execution = Some(now);
            schedule.next_execution = self.resolve_next(&from_now)?;
            tracing::info!(
                "⏭️ Schedule {schedule_id} skipped missed occurrences, next {:?}",
                schedule.next_execution
            );
        }
        if schedule.next_execution.is_none() {
            schedule.status = ScheduleStatus::Completed;
            tracing::info!(
                "✅ Schedule {schedule_id} completed after {} execution(s)",
                schedule.execution_count
            );
        }

        self.schedules.update(&schedule).await?;
        Ok(Some(schedule))
    }

    pub async fn get(&self, schedule_id: &str) -> Result<Option<ScheduledNotification>> {
        self.schedules.get_by_id(schedule_id).await
    }

    /// See [`calculate_next_execution`].
    pub fn calculate_next_execution(
        &self,
        schedule: &ScheduledNotification,
    ) -> std::result::Result<Option<DateTime<Utc>>, ScheduleError> {
        calculate_next_execution(schedule)
    }
}

/// When a recurring schedule fires after its latest execution (or after
/// `scheduled_for` if it has never fired). Pure; `Ok(None)` for one-time
/// schedules.
///
/// The result is relative to that base only and may already be in the past
/// after a long idle gap. [`Scheduler::record_execution`] moves cron
/// schedules past `now`.
///
/// Calendar patterns step on the local wall clock, so a daily 09:00 stays
/// at 09:00 local across DST. Month and year steps clamp to the last day
/// of shorter months.
pub fn calculate_next_execution(
    schedule: &ScheduledNotification,
) -> std::result::Result<Option<DateTime<Utc>>, ScheduleError> {
    if !schedule.is_recurring {
        return Ok(None);
    }
    let Some(pattern) = schedule.recurrence else {
        return Ok(None);
    };
    let base = schedule.last_execution.unwrap_or(schedule.scheduled_for);

    if pattern == RecurrencePattern::Cron {
        let expression = schedule.cron_expression.as_deref().ok_or_else(|| {
            ScheduleError::InvalidPattern(format!("schedule {} has no cron expression", schedule.id))
        })?;
        return cron::next_occurrence(expression, base, &schedule.time_zone).map(Some);
    }

    let tz = timezone::resolve_zone(&schedule.time_zone)?;
    let local = match tz {
        Some(tz) => timezone::wall_clock(tz, base),
        None => base.naive_utc(),
    };
    let next = match pattern {
        RecurrencePattern::Daily => local.checked_add_days(Days::new(1)),
        RecurrencePattern::Weekly => local.checked_add_days(Days::new(7)),
        RecurrencePattern::Monthly => local.checked_add_months(Months::new(1)),
        RecurrencePattern::Yearly => local.checked_add_months(Months::new(12)),
        RecurrencePattern::Cron => None,
    };

    Ok(next.map(|next| match tz {
        Some(tz) => timezone::localize(tz, next),
        None => next.and_utc(),
    }))
}

/// [`calculate_next_execution`] with errors logged and mapped to `None`.
pub fn next_execution_lenient(schedule: &ScheduledNotification) -> Option<DateTime<Utc>> {
    calculate_next_execution(schedule).unwrap_or_else(|e| {
        tracing::warn!("⚠️ No next execution for schedule {}: {e}", schedule.id);
        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pigeon_core::error::PigeonError;
    use chrono::{Datelike, NaiveDate, TimeZone, Timelike, Weekday};
    use pigeon_core::traits::ManualClock;
    use pigeon_core::types::ChannelType;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn payload() -> NotificationPayload {
        NotificationPayload::new(ChannelType::Email, "ana@example.com", "Reminder", "Standup soon")
    }

    fn setup(now: DateTime<Utc>) -> (Arc<MemoryStore>, Scheduler) {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::new(store.clone(), Arc::new(ManualClock::new(now)));
        (store, scheduler)
    }

    fn recurring(first: DateTime<Utc>, pattern: RecurrencePattern, zone: &str) -> ScheduledNotification {
        ScheduledNotification::recurring(payload(), first, pattern, zone, None, "test", first)
    }

    #[tokio::test]
    async fn test_one_time_converts_local_to_utc() {
        let (store, scheduler) = setup(utc(2025, 3, 1, 0, 0));
        let s = scheduler
            .schedule_one_time(payload(), local(2025, 3, 10, 14, 0), "America/Santo_Domingo", "ana")
            .await
            .unwrap();

        assert_eq!(s.scheduled_for, utc(2025, 3, 10, 18, 0));
        assert_eq!(s.next_execution, Some(utc(2025, 3, 10, 18, 0)));
        assert!(!s.is_recurring);
        assert_eq!(store.schedule(&s.id), Some(s));
    }

    #[tokio::test]
    async fn test_unknown_zone_lenient_and_strict() {
        let (_, scheduler) = setup(utc(2025, 3, 1, 0, 0));
        let s = scheduler
            .schedule_one_time(payload(), local(2025, 3, 10, 14, 0), "Mars/Olympus_Mons", "ana")
            .await
            .unwrap();
        assert_eq!(s.scheduled_for, utc(2025, 3, 10, 14, 0));

        let (store, strict) = setup(utc(2025, 3, 1, 0, 0));
        let strict = strict.with_strict(true);
        let err = strict
            .schedule_one_time(payload(), local(2025, 3, 10, 14, 0), "Mars/Olympus_Mons", "ana")
            .await
            .unwrap_err();
        assert!(matches!(err, PigeonError::Schedule(ScheduleError::UnknownTimeZone(_))));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_recurring_seeds_first_execution() {
        let (_, scheduler) = setup(utc(2025, 1, 1, 0, 0));
        let s = scheduler
            .schedule_recurring(
                payload(),
                local(2025, 1, 15, 9, 0),
                RecurrencePattern::Daily,
                "America/New_York",
                Some(5),
                "ana",
            )
            .await
            .unwrap();
        assert!(s.is_recurring);
        assert_eq!(s.next_execution, Some(utc(2025, 1, 15, 14, 0)));
        assert_eq!(s.max_executions, Some(5));
    }

    #[tokio::test]
    async fn test_recurring_rejects_cron_pattern() {
        let (store, scheduler) = setup(utc(2025, 1, 1, 0, 0));
        let err = scheduler
            .schedule_recurring(payload(), local(2025, 1, 15, 9, 0), RecurrencePattern::Cron, "UTC", None, "ana")
            .await
            .unwrap_err();
        assert!(matches!(err, PigeonError::Schedule(ScheduleError::InvalidPattern(_))));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_cron_next_monday_nine_local() {
        // Wednesday
        let (_, scheduler) = setup(utc(2025, 3, 12, 0, 0));
        let s = scheduler
            .schedule_with_cron(payload(), "0 9 * * MON", "America/Santo_Domingo", None, "ana")
            .await
            .unwrap();

        let next = s.next_execution.unwrap();
        assert_eq!(next, utc(2025, 3, 17, 13, 0));
        let wall = timezone::convert_from_utc(next, "America/Santo_Domingo");
        assert_eq!(wall.weekday(), Weekday::Mon);
        assert_eq!((wall.hour(), wall.minute()), (9, 0));
        assert_eq!(s.cron_expression.as_deref(), Some("0 9 * * MON"));
        assert!(s.is_cron());
    }

    #[tokio::test]
    async fn test_invalid_cron_degrades_or_errors() {
        let (store, scheduler) = setup(utc(2025, 3, 12, 0, 0));
        let s = scheduler
            .schedule_with_cron(payload(), "61 * * * *", "UTC", None, "ana")
            .await
            .unwrap();
        assert_eq!(s.next_execution, None);
        assert!(store.schedule(&s.id).is_some());

        let (store, strict) = setup(utc(2025, 3, 12, 0, 0));
        let err = strict
            .with_strict(true)
            .schedule_with_cron(payload(), "61 * * * *", "UTC", None, "ana")
            .await
            .unwrap_err();
        assert!(matches!(err, PigeonError::Schedule(ScheduleError::InvalidCron { .. })));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_missing_writes_nothing() {
        let (store, scheduler) = setup(utc(2025, 3, 1, 0, 0));
        let outcome = scheduler.cancel("nope", "user request", "ana").await.unwrap();
        assert_eq!(outcome, CancelOutcome::NotFound);
        assert_eq!(store.write_count(), 0);
        assert!(!outcome.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_then_cancel_again() {
        let (store, scheduler) = setup(utc(2025, 3, 1, 0, 0));
        let s = scheduler
            .schedule_one_time(payload(), local(2025, 3, 10, 14, 0), "UTC", "ana")
            .await
            .unwrap();

        let outcome = scheduler.cancel(&s.id, "trip cancelled", "bob").await.unwrap();
        assert!(outcome.is_cancelled());
        let stored = store.schedule(&s.id).unwrap();
        assert_eq!(stored.status, ScheduleStatus::Cancelled);
        assert_eq!(stored.cancel_reason.as_deref(), Some("trip cancelled"));
        assert_eq!(stored.cancelled_by.as_deref(), Some("bob"));
        assert_eq!(stored.next_execution, None);

        let writes = store.write_count();
        let again = scheduler.cancel(&s.id, "again", "bob").await.unwrap();
        assert_eq!(again, CancelOutcome::AlreadyTerminal(ScheduleStatus::Cancelled));
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_reschedule_uses_stored_zone() {
        let (_, scheduler) = setup(utc(2025, 1, 1, 0, 0));
        let s = scheduler
            .schedule_one_time(payload(), local(2025, 1, 20, 8, 0), "America/New_York", "ana")
            .await
            .unwrap();
        assert_eq!(s.scheduled_for, utc(2025, 1, 20, 13, 0));

        // July is EDT (UTC-4)
        let moved = scheduler
            .reschedule(&s.id, local(2025, 7, 1, 8, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(moved.scheduled_for, utc(2025, 7, 1, 12, 0));
        assert_eq!(moved.next_execution, Some(utc(2025, 7, 1, 12, 0)));
        assert_eq!(moved.time_zone, "America/New_York");

        assert!(scheduler.reschedule("nope", local(2025, 7, 1, 8, 0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reschedule_leaves_cancelled_alone() {
        let (store, scheduler) = setup(utc(2025, 1, 1, 0, 0));
        let s = scheduler
            .schedule_one_time(payload(), local(2025, 1, 20, 8, 0), "UTC", "ana")
            .await
            .unwrap();
        scheduler.cancel(&s.id, "no", "ana").await.unwrap();
        let writes = store.write_count();

        let same = scheduler.reschedule(&s.id, local(2025, 2, 1, 8, 0)).await.unwrap().unwrap();
        assert_eq!(same.status, ScheduleStatus::Cancelled);
        assert_eq!(same.scheduled_for, utc(2025, 1, 20, 8, 0));
        assert_eq!(store.write_count(), writes);
    }

    #[test]
    fn test_daily_keeps_local_time() {
        // 2025-01-15 09:00 EST
        let s = recurring(utc(2025, 1, 15, 14, 0), RecurrencePattern::Daily, "America/New_York");
        assert_eq!(calculate_next_execution(&s), Ok(Some(utc(2025, 1, 16, 14, 0))));
    }

    #[test]
    fn test_daily_across_dst() {
        // 09:00 EST on the 8th, 09:00 EDT on the 9th
        let mut s = recurring(utc(2025, 3, 1, 14, 0), RecurrencePattern::Daily, "America/New_York");
        s.last_execution = Some(utc(2025, 3, 8, 14, 0));
        assert_eq!(calculate_next_execution(&s), Ok(Some(utc(2025, 3, 9, 13, 0))));
    }

    #[test]
    fn test_weekly_monthly_yearly() {
        let weekly = recurring(utc(2025, 6, 2, 8, 0), RecurrencePattern::Weekly, "UTC");
        assert_eq!(calculate_next_execution(&weekly), Ok(Some(utc(2025, 6, 9, 8, 0))));

        let monthly = recurring(utc(2025, 1, 31, 8, 0), RecurrencePattern::Monthly, "UTC");
        assert_eq!(calculate_next_execution(&monthly), Ok(Some(utc(2025, 2, 28, 8, 0))));

        let yearly = recurring(utc(2024, 2, 29, 8, 0), RecurrencePattern::Yearly, "UTC");
        assert_eq!(calculate_next_execution(&yearly), Ok(Some(utc(2025, 2, 28, 8, 0))));
    }

    #[test]
    fn test_one_time_has_no_next() {
        let s = ScheduledNotification::one_time(payload(), utc(2025, 1, 1, 0, 0), "UTC", "t", utc(2025, 1, 1, 0, 0));
        assert_eq!(calculate_next_execution(&s), Ok(None));
    }

    #[test]
    fn test_cron_next_after_last_execution() {
        let mut s = recurring(utc(2025, 3, 17, 13, 0), RecurrencePattern::Cron, "America/Santo_Domingo");
        s.cron_expression = Some("0 9 * * MON".into());
        assert_eq!(calculate_next_execution(&s), Ok(Some(utc(2025, 3, 24, 13, 0))));

        s.last_execution = Some(utc(2025, 3, 24, 13, 0));
        assert_eq!(calculate_next_execution(&s), Ok(Some(utc(2025, 3, 31, 13, 0))));
    }

    #[test]
    fn test_bad_cron_strict_vs_lenient() {
        let mut s = recurring(utc(2025, 3, 17, 13, 0), RecurrencePattern::Cron, "UTC");
        s.cron_expression = Some("not cron".into());
        assert!(matches!(calculate_next_execution(&s), Err(ScheduleError::InvalidCron { .. })));
        assert_eq!(next_execution_lenient(&s), None);

        s.cron_expression = None;
        assert!(matches!(calculate_next_execution(&s), Err(ScheduleError::InvalidPattern(_))));
    }

    #[tokio::test]
    async fn test_record_execution_until_max() {
        let (store, scheduler) = setup(utc(2025, 1, 1, 0, 0));
        let s = scheduler
            .schedule_recurring(payload(), local(2025, 1, 15, 9, 0), RecurrencePattern::Daily, "UTC", Some(2), "ana")
            .await
            .unwrap();

        let first = scheduler.record_execution(&s.id, utc(2025, 1, 15, 9, 0)).await.unwrap().unwrap();
        assert_eq!(first.execution_count, 1);
        assert_eq!(first.last_execution, Some(utc(2025, 1, 15, 9, 0)));
        assert_eq!(first.next_execution, Some(utc(2025, 1, 16, 9, 0)));
        assert!(first.is_active());

        let second = scheduler.record_execution(&s.id, utc(2025, 1, 16, 9, 0)).await.unwrap().unwrap();
        assert_eq!(second.execution_count, 2);
        assert_eq!(second.status, ScheduleStatus::Completed);
        assert_eq!(second.next_execution, None);
        assert_eq!(store.schedule(&s.id), Some(second));
    }

    #[test]
    fn test_cron_next_is_relative_to_last_execution() {
        let mut s = recurring(utc(2025, 1, 6, 13, 0), RecurrencePattern::Cron, "America/Santo_Domingo");
        s.cron_expression = Some("0 9 * * MON".into());
        s.last_execution = Some(utc(2025, 1, 6, 13, 0));
        // Stays a pure step from the base even when that is long gone.
        assert_eq!(calculate_next_execution(&s), Ok(Some(utc(2025, 1, 13, 13, 0))));
    }

    #[tokio::test]
    async fn test_record_execution_skips_missed_cron_occurrences() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(utc(2025, 1, 1, 0, 0)));
        let scheduler = Scheduler::new(store.clone(), clock.clone());
        let s = scheduler
            .schedule_with_cron(payload(), "0 9 * * MON", "America/Santo_Domingo", None, "ana")
            .await
            .unwrap();
        assert_eq!(s.next_execution, Some(utc(2025, 1, 6, 13, 0)));

        // Fire reported two months late, on a Friday.
        clock.advance(chrono::Duration::days(65));
        let fired = scheduler
            .record_execution(&s.id, utc(2025, 1, 6, 13, 0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.last_execution, Some(utc(2025, 1, 6, 13, 0)));
        assert_eq!(fired.next_execution, Some(utc(2025, 3, 10, 13, 0)));
        assert!(fired.next_execution.unwrap() > clock.now());
        assert!(fired.is_active());
    }

    #[tokio::test]
    async fn test_record_execution_one_time_completes() {
        let (_, scheduler) = setup(utc(2025, 1, 1, 0, 0));
        let s = scheduler
            .schedule_one_time(payload(), local(2025, 1, 15, 9, 0), "UTC", "ana")
            .await
            .unwrap();
        let done = scheduler.record_execution(&s.id, utc(2025, 1, 15, 9, 0)).await.unwrap().unwrap();
        assert_eq!(done.status, ScheduleStatus::Completed);
        assert!(scheduler.record_execution("nope", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_execution_ignores_cancelled() {
        let (store, scheduler) = setup(utc(2025, 1, 1, 0, 0));
        let s = scheduler
            .schedule_recurring(payload(), local(2025, 1, 15, 9, 0), RecurrencePattern::Weekly, "UTC", None, "ana")
            .await
            .unwrap();
        scheduler.cancel(&s.id, "done", "ana").await.unwrap();
        let writes = store.write_count();

        let same = scheduler.record_execution(&s.id, utc(2025, 1, 15, 9, 0)).await.unwrap().unwrap();
        assert_eq!(same.execution_count, 0);
        assert_eq!(store.write_count(), writes);
    }
}
