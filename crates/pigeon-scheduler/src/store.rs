//! In-memory store — all four repositories behind one mutex.
//! Used by tests and embedders that do not need durability.
//! Claims are compare-and-set under the lock, same contract as SQLite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pigeon_core::error::{PigeonError, Result};
use pigeon_core::traits::{
    DeliveryLogRepository, NotificationRepository, QueueRepository, ScheduleRepository,
};
use pigeon_core::types::{
    DeliveryLog, Notification, QueueItem, QueueStatus, ScheduledNotification,
};

#[derive(Default)]
struct State {
    notifications: HashMap<String, Notification>,
    queue: HashMap<String, QueueItem>,
    logs: Vec<DeliveryLog>,
    schedules: HashMap<String, ScheduledNotification>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| PigeonError::storage(format!("Lock: {e}")))
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of successful mutations since creation.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn notification(&self, id: &str) -> Option<Notification> {
        self.lock().ok()?.notifications.get(id).cloned()
    }

    pub fn queue_item(&self, id: &str) -> Option<QueueItem> {
        self.lock().ok()?.queue.get(id).cloned()
    }

    pub fn schedule(&self, id: &str) -> Option<ScheduledNotification> {
        self.lock().ok()?.schedules.get(id).cloned()
    }

    pub fn logs(&self) -> Vec<DeliveryLog> {
        self.lock().map(|s| s.logs.clone()).unwrap_or_default()
    }
}

fn fifo(mut items: Vec<QueueItem>) -> Vec<QueueItem> {
    items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    items
}

#[async_trait]
impl NotificationRepository for MemoryStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<Notification>> {
        Ok(self.lock()?.notifications.get(id).cloned())
    }

    async fn add(&self, notification: &Notification) -> Result<()> {
        self.lock()?
            .notifications
            .insert(notification.id.clone(), notification.clone());
        self.wrote();
        Ok(())
    }

    async fn update(&self, notification: &Notification) -> Result<()> {
        let mut state = self.lock()?;
        let slot = state
            .notifications
            .get_mut(&notification.id)
            .ok_or_else(|| PigeonError::NotFound(format!("notification {}", notification.id)))?;
        *slot = notification.clone();
        self.wrote();
        Ok(())
    }
}

#[async_trait]
impl QueueRepository for MemoryStore {
    async fn get_pending(&self) -> Result<Vec<QueueItem>> {
        let state = self.lock()?;
        Ok(fifo(
            state
                .queue
                .values()
                .filter(|i| i.status == QueueStatus::Pending)
                .cloned()
                .collect(),
        ))
    }

    async fn get_failed(&self) -> Result<Vec<QueueItem>> {
        let state = self.lock()?;
        Ok(fifo(
            state
                .queue
                .values()
                .filter(|i| i.status == QueueStatus::Failed)
                .cloned()
                .collect(),
        ))
    }

    async fn add(&self, item: &QueueItem) -> Result<()> {
        self.lock()?.queue.insert(item.id.clone(), item.clone());
        self.wrote();
        Ok(())
    }

    async fn try_claim(&self, id: &str, token: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.lock()?;
        match state.queue.get_mut(id) {
            Some(item) if item.status == QueueStatus::Pending => {
                item.apply_claim(token, at);
                self.wrote();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn settle(&self, item: &QueueItem) -> Result<bool> {
        let mut state = self.lock()?;
        match state.queue.get_mut(&item.id) {
            Some(row)
                if row.status == QueueStatus::Processing
                    && item.claim_token.is_some()
                    && row.claim_token == item.claim_token =>
            {
                row.status = item.status;
                row.error_message = item.error_message.clone();
                self.wrote();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rearm(&self, id: &str, attempts: u32) -> Result<bool> {
        let mut state = self.lock()?;
        match state.queue.get_mut(id) {
            Some(row) if row.status == QueueStatus::Failed && row.attempts == attempts => {
                row.rearm();
                self.wrote();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update(&self, item: &QueueItem) -> Result<()> {
        let mut state = self.lock()?;
        let slot = state
            .queue
            .get_mut(&item.id)
            .ok_or_else(|| PigeonError::NotFound(format!("queue item {}", item.id)))?;
        *slot = item.clone();
        self.wrote();
        Ok(())
    }
}

#[async_trait]
impl DeliveryLogRepository for MemoryStore {
    async fn add(&self, entry: &DeliveryLog) -> Result<()> {
        self.lock()?.logs.push(entry.clone());
        self.wrote();
        Ok(())
    }

    async fn list_for_notification(&self, notification_id: &str) -> Result<Vec<DeliveryLog>> {
        Ok(self
            .lock()?
            .logs
            .iter()
            .filter(|l| l.notification_id == notification_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ScheduleRepository for MemoryStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<ScheduledNotification>> {
        Ok(self.lock()?.schedules.get(id).cloned())
    }

    async fn add(&self, schedule: &ScheduledNotification) -> Result<()> {
        self.lock()?
            .schedules
            .insert(schedule.id.clone(), schedule.clone());
        self.wrote();
        Ok(())
    }

    async fn update(&self, schedule: &ScheduledNotification) -> Result<()> {
        let mut state = self.lock()?;
        let slot = state
            .schedules
            .get_mut(&schedule.id)
            .ok_or_else(|| PigeonError::NotFound(format!("schedule {}", schedule.id)))?;
        *slot = schedule.clone();
        self.wrote();
        Ok(())
    }
}
