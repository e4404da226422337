//! Core data model for notifications, queue items, schedules, and the
//! delivery audit trail.

pub mod delivery;
pub mod notification;
pub mod queue;
pub mod schedule;

pub use delivery::{DeliveryLog, DeliveryOutcome};
pub use notification::{ChannelType, Notification, NotificationPayload, NotificationStatus};
pub use queue::{QueueItem, QueueStatus};
pub use schedule::{RecurrencePattern, ScheduleStatus, ScheduledNotification};

/// New random record id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
