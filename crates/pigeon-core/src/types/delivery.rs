//! Append-only delivery audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::notification::ChannelType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent,
    Failed,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Sent => "sent",
            DeliveryOutcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(DeliveryOutcome::Sent),
            "failed" => Some(DeliveryOutcome::Failed),
            _ => None,
        }
    }
}

/// One entry per dispatch attempt. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub id: String,
    pub notification_id: String,
    pub channel: ChannelType,
    pub outcome: DeliveryOutcome,
    pub message_id: Option<String>,
    pub error: Option<String>,
    /// Queue attempt number that produced this entry.
    pub attempt: u32,
    pub logged_at: DateTime<Utc>,
}

impl DeliveryLog {
    pub fn sent(
        notification_id: &str,
        channel: ChannelType,
        message_id: Option<String>,
        attempt: u32,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: super::new_id(),
            notification_id: notification_id.to_string(),
            channel,
            outcome: DeliveryOutcome::Sent,
            message_id,
            error: None,
            attempt,
            logged_at: at,
        }
    }

    pub fn failed(
        notification_id: &str,
        channel: ChannelType,
        error: &str,
        attempt: u32,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: super::new_id(),
            notification_id: notification_id.to_string(),
            channel,
            outcome: DeliveryOutcome::Failed,
            message_id: None,
            error: Some(error.to_string()),
            attempt,
            logged_at: at,
        }
    }
}
