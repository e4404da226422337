//! # Pigeon Scheduler
//!
//! Scheduled notifications and the delivery queue behind them.
//!
//! ## Architecture
//! ```text
//! Scheduler (caller-driven)
//!   ├── one-time:  "2025-03-10 14:00" America/Santo_Domingo → 18:00Z
//!   ├── recurring: daily / weekly / monthly / yearly on the local clock
//!   └── cron:      "0 9 * * MON" evaluated in the schedule's zone
//!         │
//!         ▼  (promotion step, external) → record_execution
//!
//! PollingWorker (tokio task, every poll_interval_secs)
//!   └── fresh Dispatcher per cycle
//!         ├── requeue_retryable (exponential backoff)
//!         └── process_pending_queue
//!               ├── try_claim (atomic Pending → Processing)
//!               ├── Email → EmailProvider
//!               ├── Sms   → SmsProvider
//!               ├── Push  → PushProvider
//!               └── Notification + QueueItem + DeliveryLog updated
//! ```
//!
//! Storage is behind the `pigeon_core` repository traits: [`SqliteStore`]
//! for real deployments, [`MemoryStore`] for tests and embedding.

pub mod cron;
pub mod dispatch;
pub mod persistence;
pub mod scheduler;
pub mod store;
pub mod timezone;
pub mod worker;

pub use cron::{CronError, CronSchedule, next_run_from_cron};
pub use dispatch::{Dispatcher, ItemOutcome, QueueRunStats};
pub use persistence::SqliteStore;
pub use scheduler::{CancelOutcome, Scheduler, calculate_next_execution, next_execution_lenient};
pub use store::MemoryStore;
pub use worker::{DispatcherFactory, PollingWorker, WorkerHandle};
