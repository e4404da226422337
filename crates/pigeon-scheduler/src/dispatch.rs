//! Delivery dispatch — drains the queue and actually sends notifications.
//!
//! ```text
//! QueueItem: Pending ──claim──▶ Processing ──▶ Completed
//!                                   │
//!                                   └──────▶ Failed ──requeue (backoff)──▶ Pending
//! ```
//!
//! The notification row is the delivery record of truth (status, retry
//! count, last error). A queue item only describes its latest attempt.
//! Every item is processed inside its own failure boundary: provider
//! errors and panics become failed attempts, and nothing escapes
//! `process_queue_item`.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Duration;
use futures::FutureExt;
use pigeon_channels::ProviderRegistry;
use pigeon_core::error::{PigeonError, Result};
use pigeon_core::traits::{
    Clock, DeliveryLogRepository, NotificationRepository, QueueRepository, SendResult,
};
use pigeon_core::types::{
    ChannelType, DeliveryLog, Notification, NotificationStatus, QueueItem, new_id,
};

/// What happened to one queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    Failed,
    /// Another worker holds the claim.
    Skipped,
}

/// Tally of one `process_pending_queue` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueRunStats {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl QueueRunStats {
    fn record(&mut self, outcome: ItemOutcome) {
        self.processed += 1;
        match outcome {
            ItemOutcome::Completed => self.completed += 1,
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
        }
    }
}

impl fmt::Display for QueueRunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} processed, {} completed, {} failed, {} skipped",
            self.processed, self.completed, self.failed, self.skipped
        )
    }
}

pub struct Dispatcher {
    notifications: Arc<dyn NotificationRepository>,
    queue: Arc<dyn QueueRepository>,
    logs: Arc<dyn DeliveryLogRepository>,
    providers: ProviderRegistry,
    clock: Arc<dyn Clock>,
    retry_backoff: Duration,
}

impl Dispatcher {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        queue: Arc<dyn QueueRepository>,
        logs: Arc<dyn DeliveryLogRepository>,
        providers: ProviderRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            notifications,
            queue,
            logs,
            providers,
            clock,
            retry_backoff: Duration::seconds(60),
        }
    }

    /// One store backing all three repositories.
    pub fn from_store<S>(store: Arc<S>, providers: ProviderRegistry, clock: Arc<dyn Clock>) -> Self
    where
        S: NotificationRepository + QueueRepository + DeliveryLogRepository + 'static,
    {
        Self::new(store.clone(), store.clone(), store, providers, clock)
    }

    /// Base delay before the first retry; doubles with each further retry.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn backoff_for(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(16);
        self.retry_backoff * 2i32.pow(exp)
    }

    /// Process every pending item, oldest first.
    pub async fn process_pending_queue(&self) -> Result<QueueRunStats> {
        let mut items = self.queue.get_pending().await?;
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut stats = QueueRunStats::default();
        for item in &items {
            stats.record(self.process_queue_item(item).await);
        }
        if stats.processed > 0 {
            tracing::info!("📬 Queue run: {stats}");
        }
        Ok(stats)
    }

    /// Claim and deliver one item. Never returns an error.
    pub async fn process_queue_item(&self, item: &QueueItem) -> ItemOutcome {
        let mut working = item.clone();
        // Set again only once this dispatcher wins the claim.
        working.claim_token = None;

        match self.try_process(&mut working).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("❌ Queue item {} failed: {e}", item.id);
                if working.claim_token.is_some() {
                    working.mark_failed(&e.to_string());
                    if let Err(e) = self.settle(&working).await {
                        tracing::error!("❌ Could not record failure of queue item {}: {e}", item.id);
                    }
                }
                ItemOutcome::Failed
            }
        }
    }

    async fn try_process(&self, item: &mut QueueItem) -> Result<ItemOutcome> {
        let claimed_at = self.clock.now();
        let token = new_id();
        if !self.queue.try_claim(&item.id, &token, claimed_at).await? {
            tracing::debug!("Queue item {} already claimed, skipping", item.id);
            return Ok(ItemOutcome::Skipped);
        }
        item.apply_claim(&token, claimed_at);

        let Some(mut notification) = self.notifications.get_by_id(&item.notification_id).await? else {
            tracing::warn!(
                "⚠️ Notification {} for queue item {} not found",
                item.notification_id,
                item.id
            );
            item.mark_failed("Notification not found");
            self.settle(item).await?;
            return Ok(ItemOutcome::Failed);
        };

        if notification.status == NotificationStatus::Sent {
            tracing::info!("Notification {} already sent, closing item {}", notification.id, item.id);
            item.mark_completed();
            self.settle(item).await?;
            return Ok(ItemOutcome::Completed);
        }
        if notification.is_terminal() {
            let reason = notification
                .last_error
                .clone()
                .unwrap_or_else(|| "Retries exhausted".to_string());
            item.mark_failed(&reason);
            self.settle(item).await?;
            return Ok(ItemOutcome::Failed);
        }

        let result = self.send(&notification).await;
        let now = self.clock.now();

        if result.success {
            notification.mark_sent(now)?;
            self.notifications.update(&notification).await?;
            self.logs
                .add(&DeliveryLog::sent(
                    &notification.id,
                    notification.channel,
                    result.message_id.clone(),
                    item.attempts,
                    now,
                ))
                .await?;
            item.mark_completed();
            self.settle(item).await?;
            tracing::info!(
                "✅ Delivered {} via {} to {}",
                notification.id,
                notification.channel,
                notification.recipient
            );
            Ok(ItemOutcome::Completed)
        } else {
            let error = result
                .error
                .unwrap_or_else(|| "Delivery failed".to_string());
            notification.mark_failed(&error)?;
            self.notifications.update(&notification).await?;
            self.logs
                .add(&DeliveryLog::failed(
                    &notification.id,
                    notification.channel,
                    &error,
                    item.attempts,
                    now,
                ))
                .await?;
            item.mark_failed(&error);
            self.settle(item).await?;
            if notification.can_retry() {
                tracing::warn!(
                    "⚠️ Delivery of {} failed ({}/{}): {error}",
                    notification.id,
                    notification.retry_count,
                    notification.max_retries
                );
            } else {
                tracing::warn!("❌ Delivery of {} failed for good: {error}", notification.id);
            }
            Ok(ItemOutcome::Failed)
        }
    }

    /// Write the attempt outcome while this dispatcher still holds the claim.
    async fn settle(&self, item: &QueueItem) -> Result<()> {
        if !self.queue.settle(item).await? {
            tracing::warn!(
                "⚠️ Queue item {} changed hands, outcome {} not recorded",
                item.id,
                item.status.as_str()
            );
        }
        Ok(())
    }

    /// Route to the channel's provider. Errors and panics come back as a
    /// failed [`SendResult`].
    async fn send(&self, n: &Notification) -> SendResult {
        let attempt = async {
            match n.channel {
                ChannelType::Email => match self.providers.email() {
                    Some(p) => p.send(&n.recipient, &n.subject, &n.content, true, &n.metadata).await,
                    None => Ok(not_configured(n.channel)),
                },
                ChannelType::Sms => match self.providers.sms() {
                    Some(p) => p.send(&n.recipient, &n.content, &n.metadata).await,
                    None => Ok(not_configured(n.channel)),
                },
                ChannelType::Push => match self.providers.push() {
                    Some(p) => {
                        p.send(&n.recipient, &n.subject, &n.content, None, &n.metadata)
                            .await
                    }
                    None => Ok(not_configured(n.channel)),
                },
                ChannelType::Unknown => Ok(SendResult::failed(format!(
                    "Unsupported notification type for {}",
                    n.id
                ))),
            }
        };

        match AssertUnwindSafe(attempt).catch_unwind().await {
            Ok(Ok(result)) if !result.success && result.error.is_none() => {
                SendResult::failed("Provider reported failure without a reason")
            }
            Ok(Ok(result)) => result,
            Ok(Err(e)) => SendResult::failed(e.to_string()),
            Err(panic) => SendResult::failed(format!("Provider panicked: {}", panic_message(&*panic))),
        }
    }

    /// Persist a pending notification and its queue item.
    pub async fn enqueue(&self, notification: Notification) -> Result<QueueItem> {
        if notification.status != NotificationStatus::Pending {
            return Err(PigeonError::InvalidTransition(format!(
                "only pending notifications can be enqueued ({} is {})",
                notification.id,
                notification.status.as_str()
            )));
        }
        self.notifications.add(&notification).await?;
        let item = QueueItem::new(&notification.id, self.clock.now());
        self.queue.add(&item).await?;
        tracing::info!(
            "📥 Enqueued {} ({} to {})",
            notification.id,
            notification.channel,
            notification.recipient
        );
        Ok(item)
    }

    /// Put failed items back to Pending when their notification can still
    /// be retried and its backoff has elapsed. Returns how many moved.
    ///
    /// A Pending notification behind a Failed item means the attempt broke
    /// before its outcome reached the notification; it is retried while the
    /// item has used no more than the notification's retry allowance.
    pub async fn requeue_retryable(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut rearmed = 0;

        for item in self.queue.get_failed().await? {
            let notification = match self.notifications.get_by_id(&item.notification_id).await {
                Ok(Some(n)) => n,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("⚠️ Requeue: loading {} failed: {e}", item.notification_id);
                    continue;
                }
            };
            let retryable = match notification.status {
                NotificationStatus::Failed => notification.can_retry(),
                NotificationStatus::Pending => item.attempts <= notification.max_retries,
                NotificationStatus::Sent => false,
            };
            if !retryable {
                continue;
            }
            let wait = self.backoff_for(notification.retry_count);
            if !item.last_attempt_at.is_none_or(|at| at + wait <= now) {
                continue;
            }

            match self.queue.rearm(&item.id, item.attempts).await {
                Ok(true) => {
                    rearmed += 1;
                    tracing::debug!(
                        "Re-armed {} (retry {}/{})",
                        item.id,
                        notification.retry_count,
                        notification.max_retries
                    );
                }
                Ok(false) => tracing::debug!("Queue item {} moved on, not re-arming", item.id),
                Err(e) => tracing::warn!("⚠️ Requeue of {} failed: {e}", item.id),
            }
        }

        if rearmed > 0 {
            tracing::info!("🔁 Re-armed {rearmed} failed deliveries");
        }
        Ok(rearmed)
    }
}

fn not_configured(channel: ChannelType) -> SendResult {
    SendResult::failed(format!("No {channel} provider configured"))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use pigeon_core::traits::{EmailProvider, ManualClock, PushProvider, SmsProvider};
    use pigeon_core::types::{DeliveryOutcome, QueueStatus};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Recipient local part picks the behaviour: fail@, error@, panic@.
    #[derive(Default)]
    struct FakeEmail {
        calls: Mutex<Vec<(String, String, bool)>>,
    }

    #[async_trait]
    impl EmailProvider for FakeEmail {
        fn name(&self) -> &str {
            "fake-email"
        }

        async fn send(
            &self,
            to: &str,
            subject: &str,
            _body: &str,
            is_html: bool,
            _metadata: &BTreeMap<String, String>,
        ) -> Result<SendResult> {
            self.calls
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string(), is_html));
            match to.split('@').next().unwrap_or_default() {
                "fail" => Ok(SendResult::failed("mailbox full")),
                "error" => Err(PigeonError::provider("connection reset")),
                "panic" => panic!("provider bug"),
                "silent" => Ok(SendResult {
                    success: false,
                    message_id: None,
                    error: None,
                }),
                _ => Ok(SendResult::ok(format!("msg-{to}"))),
            }
        }
    }

    #[derive(Default)]
    struct FakeSms {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SmsProvider for FakeSms {
        fn name(&self) -> &str {
            "fake-sms"
        }

        async fn send(&self, to: &str, body: &str, _metadata: &BTreeMap<String, String>) -> Result<SendResult> {
            self.calls.lock().unwrap().push((to.to_string(), body.to_string()));
            Ok(SendResult::ok("sms-1"))
        }
    }

    #[derive(Default)]
    struct FakePush {
        calls: Mutex<Vec<(String, String, String, bool)>>,
    }

    #[async_trait]
    impl PushProvider for FakePush {
        fn name(&self) -> &str {
            "fake-push"
        }

        async fn send(
            &self,
            device_token: &str,
            title: &str,
            body: &str,
            data: Option<&serde_json::Value>,
            _metadata: &BTreeMap<String, String>,
        ) -> Result<SendResult> {
            self.calls.lock().unwrap().push((
                device_token.to_string(),
                title.to_string(),
                body.to_string(),
                data.is_some(),
            ));
            Ok(SendResult::ok("push-1"))
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        email: Arc<FakeEmail>,
        sms: Arc<FakeSms>,
        push: Arc<FakePush>,
        dispatcher: Dispatcher,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let email = Arc::new(FakeEmail::default());
        let sms = Arc::new(FakeSms::default());
        let push = Arc::new(FakePush::default());
        let providers = ProviderRegistry::new()
            .with_email(email.clone())
            .with_sms(sms.clone())
            .with_push(push.clone());
        let dispatcher = Dispatcher::from_store(store.clone(), providers, clock.clone());
        Harness {
            store,
            clock,
            email,
            sms,
            push,
            dispatcher,
        }
    }

    impl Harness {
        async fn enqueue(&self, notification: Notification) -> (String, QueueItem) {
            self.clock.advance(Duration::seconds(1));
            let id = notification.id.clone();
            let item = self.dispatcher.enqueue(notification).await.unwrap();
            (id, item)
        }

        async fn email(&self, to: &str) -> (String, QueueItem) {
            self.enqueue(Notification::new(ChannelType::Email, to, "Invoice", "<p>Due</p>"))
                .await
        }
    }

    #[tokio::test]
    async fn test_successful_delivery() {
        let h = harness();
        let (nid, item) = h.email("ana@example.com").await;

        assert_eq!(h.dispatcher.process_queue_item(&item).await, ItemOutcome::Completed);

        let n = h.store.notification(&nid).unwrap();
        assert_eq!(n.status, NotificationStatus::Sent);
        assert_eq!(n.sent_at, Some(h.clock.now()));
        let q = h.store.queue_item(&item.id).unwrap();
        assert_eq!(q.status, QueueStatus::Completed);
        assert_eq!(q.attempts, 1);
        let logs = h.store.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, DeliveryOutcome::Sent);
        assert_eq!(logs[0].message_id.as_deref(), Some("msg-ana@example.com"));
    }

    #[tokio::test]
    async fn test_middle_item_error_does_not_stop_run() {
        let h = harness();
        let (n1, i1) = h.email("one@example.com").await;
        let (n2, i2) = h.email("error@example.com").await;
        let (n3, i3) = h.email("three@example.com").await;

        let stats = h.dispatcher.process_pending_queue().await.unwrap();
        assert_eq!(
            stats,
            QueueRunStats {
                processed: 3,
                completed: 2,
                failed: 1,
                skipped: 0
            }
        );

        assert_eq!(h.store.queue_item(&i1.id).unwrap().status, QueueStatus::Completed);
        assert_eq!(h.store.queue_item(&i2.id).unwrap().status, QueueStatus::Failed);
        assert_eq!(h.store.queue_item(&i3.id).unwrap().status, QueueStatus::Completed);
        assert_eq!(h.store.notification(&n1).unwrap().status, NotificationStatus::Sent);
        assert_eq!(h.store.notification(&n3).unwrap().status, NotificationStatus::Sent);

        let failed = h.store.notification(&n2).unwrap();
        assert_eq!(failed.status, NotificationStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.last_error.unwrap().contains("connection reset"));

        let calls: Vec<String> = h.email.calls.lock().unwrap().iter().map(|c| c.0.clone()).collect();
        assert_eq!(calls, vec!["one@example.com", "error@example.com", "three@example.com"]);
    }

    #[tokio::test]
    async fn test_failure_result_is_recorded() {
        let h = harness();
        let (nid, item) = h.email("fail@example.com").await;

        assert_eq!(h.dispatcher.process_queue_item(&item).await, ItemOutcome::Failed);

        let n = h.store.notification(&nid).unwrap();
        assert_eq!(n.status, NotificationStatus::Failed);
        assert!(n.can_retry());
        let q = h.store.queue_item(&item.id).unwrap();
        assert_eq!(q.error_message.as_deref(), Some("mailbox full"));
        let logs = h.store.logs();
        assert_eq!(logs[0].outcome, DeliveryOutcome::Failed);
        assert_eq!(logs[0].error.as_deref(), Some("mailbox full"));
        assert_eq!(logs[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_provider_panic_becomes_failure() {
        let h = harness();
        let (nid, item) = h.email("panic@example.com").await;

        assert_eq!(h.dispatcher.process_queue_item(&item).await, ItemOutcome::Failed);
        let n = h.store.notification(&nid).unwrap();
        assert!(n.last_error.unwrap().contains("provider bug"));
    }

    #[tokio::test]
    async fn test_failure_without_reason_gets_one() {
        let h = harness();
        let (nid, item) = h.email("silent@example.com").await;
        h.dispatcher.process_queue_item(&item).await;
        assert!(h.store.notification(&nid).unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn test_exhausted_notification_stays_failed() {
        let h = harness();
        let mut n = Notification::new(ChannelType::Email, "fail@example.com", "s", "b").with_max_retries(2);
        n.retry_count = 2;
        let (nid, item) = h.enqueue(n).await;

        assert_eq!(h.dispatcher.process_queue_item(&item).await, ItemOutcome::Failed);
        let after_first = h.store.notification(&nid).unwrap();
        assert_eq!(after_first.status, NotificationStatus::Failed);
        assert_eq!(after_first.retry_count, 2);
        assert!(after_first.is_terminal());

        // Nothing re-arms it...
        assert_eq!(h.dispatcher.requeue_retryable().await.unwrap(), 0);

        // ...and a forced re-run does not send again.
        assert!(h.store.rearm(&item.id, 1).await.unwrap());
        let forced = h.store.queue_item(&item.id).unwrap();
        assert_eq!(h.dispatcher.process_queue_item(&forced).await, ItemOutcome::Failed);

        assert_eq!(h.email.calls.lock().unwrap().len(), 1);
        assert_eq!(h.store.notification(&nid).unwrap(), after_first);
        assert_eq!(h.store.queue_item(&item.id).unwrap().status, QueueStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_notification_fails_item() {
        let h = harness();
        let item = QueueItem::new("ghost", t0());
        QueueRepository::add(h.store.as_ref(), &item).await.unwrap();

        assert_eq!(h.dispatcher.process_queue_item(&item).await, ItemOutcome::Failed);
        let q = h.store.queue_item(&item.id).unwrap();
        assert_eq!(q.status, QueueStatus::Failed);
        assert_eq!(q.error_message.as_deref(), Some("Notification not found"));
        assert!(h.store.logs().is_empty());
        assert_eq!(h.dispatcher.requeue_retryable().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_already_sent_is_not_resent() {
        let h = harness();
        let (nid, item) = h.email("ana@example.com").await;
        let mut n = h.store.notification(&nid).unwrap();
        n.mark_sent(t0()).unwrap();
        NotificationRepository::update(h.store.as_ref(), &n).await.unwrap();

        assert_eq!(h.dispatcher.process_queue_item(&item).await, ItemOutcome::Completed);
        assert!(h.email.calls.lock().unwrap().is_empty());
        assert!(h.store.logs().is_empty());
    }

    #[tokio::test]
    async fn test_channel_mapping() {
        let h = harness();
        let (_, sms) = h
            .enqueue(Notification::new(ChannelType::Sms, "+18095550100", "ignored", "Code 1234"))
            .await;
        let (_, push) = h
            .enqueue(Notification::new(ChannelType::Push, "device-token", "Shipped", "On its way"))
            .await;
        let (_, email) = h.email("ana@example.com").await;

        h.dispatcher.process_queue_item(&sms).await;
        h.dispatcher.process_queue_item(&push).await;
        h.dispatcher.process_queue_item(&email).await;

        assert_eq!(
            h.sms.calls.lock().unwrap().clone(),
            vec![("+18095550100".to_string(), "Code 1234".to_string())]
        );
        assert_eq!(
            h.push.calls.lock().unwrap().clone(),
            vec![(
                "device-token".to_string(),
                "Shipped".to_string(),
                "On its way".to_string(),
                false
            )]
        );
        assert_eq!(
            h.email.calls.lock().unwrap().clone(),
            vec![("ana@example.com".to_string(), "Invoice".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_unknown_or_unconfigured_channel_fails_fast() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::from_store(
            store.clone(),
            ProviderRegistry::new(),
            Arc::new(ManualClock::new(t0())),
        );

        let sms = Notification::new(ChannelType::Sms, "+1", "", "hi");
        let sms_id = sms.id.clone();
        let item = dispatcher.enqueue(sms).await.unwrap();
        assert_eq!(dispatcher.process_queue_item(&item).await, ItemOutcome::Failed);
        assert!(store.notification(&sms_id).unwrap().last_error.unwrap().contains("No sms provider"));

        let odd = Notification::new(ChannelType::Unknown, "?", "", "hi");
        let odd_id = odd.id.clone();
        let item = dispatcher.enqueue(odd).await.unwrap();
        assert_eq!(dispatcher.process_queue_item(&item).await, ItemOutcome::Failed);
        assert!(store.notification(&odd_id).unwrap().last_error.unwrap().contains("Unsupported"));
    }

    #[tokio::test]
    async fn test_lost_claim_is_skipped() {
        let h = harness();
        let (nid, item) = h.email("ana@example.com").await;
        assert!(h.store.try_claim(&item.id, "other-worker", t0()).await.unwrap());
        let writes = h.store.write_count();

        assert_eq!(h.dispatcher.process_queue_item(&item).await, ItemOutcome::Skipped);
        assert_eq!(h.store.write_count(), writes);
        assert_eq!(h.store.notification(&nid).unwrap().status, NotificationStatus::Pending);
        assert!(h.email.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_two_dispatchers_one_send() {
        let h = harness();
        let (_, item) = h.email("ana@example.com").await;
        let providers = ProviderRegistry::new().with_email(h.email.clone());
        let rival = Dispatcher::from_store(h.store.clone(), providers, h.clock.clone());

        let (a, b) = tokio::join!(
            h.dispatcher.process_queue_item(&item),
            rival.process_queue_item(&item)
        );
        let mut outcomes = [a, b];
        outcomes.sort_by_key(|o| *o == ItemOutcome::Skipped);
        assert_eq!(outcomes, [ItemOutcome::Completed, ItemOutcome::Skipped]);
        assert_eq!(h.email.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_requeue_waits_for_backoff() {
        let h = harness();
        let (nid, item) = h.email("fail@example.com").await;
        h.dispatcher.process_queue_item(&item).await;

        h.clock.advance(Duration::seconds(30));
        assert_eq!(h.dispatcher.requeue_retryable().await.unwrap(), 0);

        h.clock.advance(Duration::seconds(31));
        assert_eq!(h.dispatcher.requeue_retryable().await.unwrap(), 1);
        let q = h.store.queue_item(&item.id).unwrap();
        assert_eq!(q.status, QueueStatus::Pending);
        assert_eq!(q.error_message.as_deref(), Some("mailbox full"));

        // Second failure doubles the wait.
        h.dispatcher.process_pending_queue().await.unwrap();
        assert_eq!(h.store.notification(&nid).unwrap().retry_count, 2);
        h.clock.advance(Duration::seconds(61));
        assert_eq!(h.dispatcher.requeue_retryable().await.unwrap(), 0);
        h.clock.advance(Duration::seconds(60));
        assert_eq!(h.dispatcher.requeue_retryable().await.unwrap(), 1);
        assert_eq!(h.store.queue_item(&item.id).unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let h = harness();
        let (nid, item) = h.email("error@example.com").await;
        h.dispatcher.process_queue_item(&item).await;

        // Same address now works.
        let mut n = h.store.notification(&nid).unwrap();
        n.recipient = "ana@example.com".into();
        NotificationRepository::update(h.store.as_ref(), &n).await.unwrap();

        h.clock.advance(Duration::minutes(5));
        assert_eq!(h.dispatcher.requeue_retryable().await.unwrap(), 1);
        let stats = h.dispatcher.process_pending_queue().await.unwrap();
        assert_eq!(stats.completed, 1);

        let n = h.store.notification(&nid).unwrap();
        assert_eq!(n.status, NotificationStatus::Sent);
        assert_eq!(n.retry_count, 1);
        let logs = h.store.list_for_notification(&nid).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].attempt, 2);
    }

    /// First call fails, later calls succeed after `delay_ms`.
    #[derive(Default)]
    struct FlakySms {
        calls: AtomicUsize,
        delay_ms: u64,
    }

    #[async_trait]
    impl SmsProvider for FlakySms {
        fn name(&self) -> &str {
            "flaky-sms"
        }

        async fn send(&self, _to: &str, _body: &str, _metadata: &BTreeMap<String, String>) -> Result<SendResult> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(SendResult::failed("carrier busy"));
            }
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            Ok(SendResult::ok("sms-retry"))
        }
    }

    /// Queue view whose failed-item scan returns a snapshot that is
    /// `delay_ms` old by the time the caller sees it.
    struct LaggingQueue {
        inner: Arc<MemoryStore>,
        delay_ms: u64,
    }

    #[async_trait]
    impl QueueRepository for LaggingQueue {
        async fn get_pending(&self) -> Result<Vec<QueueItem>> {
            self.inner.get_pending().await
        }

        async fn get_failed(&self) -> Result<Vec<QueueItem>> {
            let snapshot = self.inner.get_failed().await?;
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            Ok(snapshot)
        }

        async fn add(&self, item: &QueueItem) -> Result<()> {
            QueueRepository::add(self.inner.as_ref(), item).await
        }

        async fn try_claim(&self, id: &str, token: &str, at: DateTime<Utc>) -> Result<bool> {
            self.inner.try_claim(id, token, at).await
        }

        async fn settle(&self, item: &QueueItem) -> Result<bool> {
            self.inner.settle(item).await
        }

        async fn rearm(&self, id: &str, attempts: u32) -> Result<bool> {
            self.inner.rearm(id, attempts).await
        }

        async fn update(&self, item: &QueueItem) -> Result<()> {
            QueueRepository::update(self.inner.as_ref(), item).await
        }
    }

    /// Notification writes fail `failures` times with a lock error.
    struct LockedNotifications {
        inner: Arc<MemoryStore>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl NotificationRepository for LockedNotifications {
        async fn get_by_id(&self, id: &str) -> Result<Option<Notification>> {
            NotificationRepository::get_by_id(self.inner.as_ref(), id).await
        }

        async fn add(&self, notification: &Notification) -> Result<()> {
            NotificationRepository::add(self.inner.as_ref(), notification).await
        }

        async fn update(&self, notification: &Notification) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(PigeonError::storage("database is locked"));
            }
            NotificationRepository::update(self.inner.as_ref(), notification).await
        }
    }

    #[tokio::test]
    async fn test_stale_requeue_cannot_resend_claimed_retry() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let sms = Arc::new(FlakySms {
            delay_ms: 200,
            ..Default::default()
        });
        let fast = Dispatcher::from_store(
            store.clone(),
            ProviderRegistry::new().with_sms(sms.clone()),
            clock.clone(),
        );
        let slow = Dispatcher::new(
            store.clone(),
            Arc::new(LaggingQueue {
                inner: store.clone(),
                delay_ms: 100,
            }),
            store.clone(),
            ProviderRegistry::new().with_sms(sms.clone()),
            clock.clone(),
        );

        let item = fast
            .enqueue(Notification::new(ChannelType::Sms, "+18095550100", "", "Code 4242"))
            .await
            .unwrap();
        assert_eq!(fast.process_queue_item(&item).await, ItemOutcome::Failed);
        clock.advance(Duration::minutes(5));

        // The slow dispatcher reads the failed row first, then acts on it
        // while the fast one has already re-armed, claimed, and is sending.
        let (slow_rearmed, fast_run) = tokio::join!(slow.requeue_retryable(), async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            fast.requeue_retryable().await.unwrap();
            fast.process_pending_queue().await.unwrap()
        });
        assert_eq!(fast_run.completed, 1);
        assert_eq!(slow_rearmed.unwrap(), 0);
        assert_eq!(slow.process_pending_queue().await.unwrap(), QueueRunStats::default());

        assert_eq!(sms.calls.load(Ordering::SeqCst), 2);
        let q = store.queue_item(&item.id).unwrap();
        assert_eq!(q.status, QueueStatus::Completed);
        assert_eq!(q.attempts, 2);
        assert_eq!(store.notification(&item.notification_id).unwrap().status, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn test_lost_notification_write_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let sms = Arc::new(FakeSms::default());
        let dispatcher = Dispatcher::new(
            Arc::new(LockedNotifications {
                inner: store.clone(),
                failures: AtomicUsize::new(1),
            }),
            store.clone(),
            store.clone(),
            ProviderRegistry::new().with_sms(sms.clone()),
            clock.clone(),
        );

        let item = dispatcher
            .enqueue(Notification::new(ChannelType::Sms, "+18095550100", "", "Code 4242"))
            .await
            .unwrap();
        assert_eq!(dispatcher.process_queue_item(&item).await, ItemOutcome::Failed);
        assert_eq!(store.queue_item(&item.id).unwrap().status, QueueStatus::Failed);
        let n = store.notification(&item.notification_id).unwrap();
        assert_eq!(n.status, NotificationStatus::Pending);

        clock.advance(Duration::seconds(30));
        assert_eq!(dispatcher.requeue_retryable().await.unwrap(), 0);
        clock.advance(Duration::seconds(31));
        assert_eq!(dispatcher.requeue_retryable().await.unwrap(), 1);
        assert_eq!(dispatcher.process_pending_queue().await.unwrap().completed, 1);

        assert_eq!(sms.calls.lock().unwrap().len(), 2);
        assert_eq!(
            store.notification(&item.notification_id).unwrap().status,
            NotificationStatus::Sent
        );
        assert_eq!(dispatcher.requeue_retryable().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_orphaned_attempts_stop_at_retry_allowance() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let dispatcher = Dispatcher::new(
            Arc::new(LockedNotifications {
                inner: store.clone(),
                failures: AtomicUsize::new(usize::MAX),
            }),
            store.clone(),
            store.clone(),
            ProviderRegistry::new().with_sms(Arc::new(FakeSms::default())),
            clock.clone(),
        );

        let item = dispatcher
            .enqueue(Notification::new(ChannelType::Sms, "+1", "", "hi").with_max_retries(1))
            .await
            .unwrap();
        dispatcher.process_queue_item(&item).await;
        clock.advance(Duration::hours(1));
        assert_eq!(dispatcher.requeue_retryable().await.unwrap(), 1);
        dispatcher.process_pending_queue().await.unwrap();

        clock.advance(Duration::hours(1));
        assert_eq!(dispatcher.requeue_retryable().await.unwrap(), 0);
        assert_eq!(store.queue_item(&item.id).unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_non_pending() {
        let h = harness();
        let mut n = Notification::new(ChannelType::Email, "ana@example.com", "s", "b");
        n.mark_sent(t0()).unwrap();
        let err = h.dispatcher.enqueue(n).await.unwrap_err();
        assert!(matches!(err, PigeonError::InvalidTransition(_)));
        assert_eq!(h.store.write_count(), 0);
    }
}
