//! Persistence contracts. Every call is an I/O boundary and may suspend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{DeliveryLog, Notification, QueueItem, ScheduledNotification};

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<Notification>>;
    async fn add(&self, notification: &Notification) -> Result<()>;
    async fn update(&self, notification: &Notification) -> Result<()>;
}

#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Pending items, oldest first.
    async fn get_pending(&self) -> Result<Vec<QueueItem>>;
    /// Failed items, oldest first.
    async fn get_failed(&self) -> Result<Vec<QueueItem>>;
    async fn add(&self, item: &QueueItem) -> Result<()>;
    /// Atomically move `id` from Pending to Processing, bumping its attempt
    /// count and stamping `token` and `at`. Returns `false` when the row is
    /// missing or no longer Pending, i.e. another worker won the claim.
    async fn try_claim(&self, id: &str, token: &str, at: DateTime<Utc>) -> Result<bool>;
    /// Record the outcome (status, error) of a claimed attempt. Applies only
    /// while the row is Processing under `item.claim_token`; `false` means
    /// the caller no longer holds the claim and nothing was written.
    async fn settle(&self, item: &QueueItem) -> Result<bool>;
    /// Move `id` from Failed back to Pending, clearing its claim. Applies
    /// only while the row is still Failed after exactly `attempts` attempts.
    async fn rearm(&self, id: &str, attempts: u32) -> Result<bool>;
    /// Unconditional overwrite, for maintenance outside the delivery path.
    async fn update(&self, item: &QueueItem) -> Result<()>;
}

#[async_trait]
pub trait DeliveryLogRepository: Send + Sync {
    async fn add(&self, entry: &DeliveryLog) -> Result<()>;
    async fn list_for_notification(&self, notification_id: &str) -> Result<Vec<DeliveryLog>>;
}

#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<ScheduledNotification>>;
    async fn add(&self, schedule: &ScheduledNotification) -> Result<()>;
    async fn update(&self, schedule: &ScheduledNotification) -> Result<()>;
}
