//! Queue items — one delivery-attempt unit per notification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue item status.
///
/// ```text
/// Pending ──claim──► Processing ──► Completed
///    ▲                    │
///    └──── re-arm ◄── Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

/// A queued delivery attempt for one notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub notification_id: String,
    pub status: QueueStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Token of the worker that last claimed this row.
    pub claim_token: Option<String>,
}

impl QueueItem {
    pub fn new(notification_id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: super::new_id(),
            notification_id: notification_id.to_string(),
            status: QueueStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            error_message: None,
            created_at,
            claim_token: None,
        }
    }

    /// Apply a successful claim locally, mirroring what the store did.
    pub fn apply_claim(&mut self, token: &str, at: DateTime<Utc>) {
        self.status = QueueStatus::Processing;
        self.attempts += 1;
        self.last_attempt_at = Some(at);
        self.claim_token = Some(token.to_string());
    }

    pub fn mark_completed(&mut self) {
        self.status = QueueStatus::Completed;
        self.error_message = None;
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = QueueStatus::Failed;
        self.error_message = Some(error.to_string());
    }

    /// Put a failed row back in line for another attempt.
    pub fn rearm(&mut self) {
        self.status = QueueStatus::Pending;
        self.claim_token = None;
    }
}
