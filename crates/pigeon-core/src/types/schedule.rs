//! Scheduled notifications — when (and how often) a payload should fire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::notification::NotificationPayload;

/// How a recurring schedule advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrencePattern {
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Cron,
}

impl RecurrencePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrencePattern::Daily => "daily",
            RecurrencePattern::Weekly => "weekly",
            RecurrencePattern::Monthly => "monthly",
            RecurrencePattern::Yearly => "yearly",
            RecurrencePattern::Cron => "cron",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(RecurrencePattern::Daily),
            "weekly" => Some(RecurrencePattern::Weekly),
            "monthly" => Some(RecurrencePattern::Monthly),
            "yearly" => Some(RecurrencePattern::Yearly),
            "cron" => Some(RecurrencePattern::Cron),
            _ => None,
        }
    }
}

/// Schedule status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Cancelled,
    Completed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Cancelled => "cancelled",
            ScheduleStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ScheduleStatus::Active),
            "cancelled" => Some(ScheduleStatus::Cancelled),
            "completed" => Some(ScheduleStatus::Completed),
            _ => None,
        }
    }
}

/// A stored specification of future notification(s).
///
/// `scheduled_for` and `next_execution` are always UTC. `time_zone` is the
/// zone the schedule was authored in and is reused whenever local wall-clock
/// times have to be recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    pub id: String,
    pub payload: NotificationPayload,
    pub scheduled_for: DateTime<Utc>,
    pub time_zone: String,
    pub is_recurring: bool,
    pub recurrence: Option<RecurrencePattern>,
    pub cron_expression: Option<String>,
    pub last_execution: Option<DateTime<Utc>>,
    pub next_execution: Option<DateTime<Utc>>,
    pub max_executions: Option<u32>,
    pub execution_count: u32,
    pub status: ScheduleStatus,
    pub created_by: String,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledNotification {
    /// A fire-once schedule.
    pub fn one_time(
        payload: NotificationPayload,
        scheduled_for: DateTime<Utc>,
        time_zone: &str,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: super::new_id(),
            payload,
            scheduled_for,
            time_zone: time_zone.to_string(),
            is_recurring: false,
            recurrence: None,
            cron_expression: None,
            last_execution: None,
            next_execution: Some(scheduled_for),
            max_executions: Some(1),
            execution_count: 0,
            status: ScheduleStatus::Active,
            created_by: created_by.to_string(),
            cancel_reason: None,
            cancelled_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A recurring schedule; `next_execution` is left for the caller to seed.
    pub fn recurring(
        payload: NotificationPayload,
        scheduled_for: DateTime<Utc>,
        pattern: RecurrencePattern,
        time_zone: &str,
        max_executions: Option<u32>,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            is_recurring: true,
            recurrence: Some(pattern),
            max_executions,
            next_execution: None,
            ..Self::one_time(payload, scheduled_for, time_zone, created_by, now)
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ScheduleStatus::Active
    }

    pub fn is_cron(&self) -> bool {
        self.recurrence == Some(RecurrencePattern::Cron)
    }

    /// Whether the execution cap has been hit.
    pub fn max_reached(&self) -> bool {
        self.max_executions
            .is_some_and(|max| self.execution_count >= max)
    }
}
