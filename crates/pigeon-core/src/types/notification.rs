//! Notification — one message intended for one recipient.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PigeonError, Result};

/// Delivery channel of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Email,
    Sms,
    Push,
    /// A stored channel name this build does not recognize.
    #[serde(other)]
    Unknown,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Email => "email",
            ChannelType::Sms => "sms",
            ChannelType::Push => "push",
            ChannelType::Unknown => "unknown",
        }
    }

    /// Parse a stored channel name. Unrecognized names map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" => ChannelType::Email,
            "sms" => ChannelType::Sms,
            "push" => ChannelType::Push,
            _ => ChannelType::Unknown,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(NotificationStatus::Pending),
            "sent" => Some(NotificationStatus::Sent),
            "failed" => Some(NotificationStatus::Failed),
            _ => None,
        }
    }
}

/// What to send, without any delivery state. Stored on schedules and
/// turned into a fresh [`Notification`] every time a schedule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub channel: ChannelType,
    pub recipient: String,
    #[serde(default)]
    pub subject: String,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl NotificationPayload {
    pub fn new(channel: ChannelType, recipient: &str, subject: &str, content: &str) -> Self {
        Self {
            channel,
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            content: content.to_string(),
            metadata: BTreeMap::new(),
            max_retries: default_max_retries(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Materialize a pending notification from this payload.
    pub fn instantiate(&self, created_at: DateTime<Utc>) -> Notification {
        Notification {
            id: super::new_id(),
            channel: self.channel,
            recipient: self.recipient.clone(),
            subject: self.subject.clone(),
            content: self.content.clone(),
            metadata: self.metadata.clone(),
            status: NotificationStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries,
            created_at,
            sent_at: None,
            last_error: None,
        }
    }
}

/// A notification and its delivery state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub channel: ChannelType,
    pub recipient: String,
    pub subject: String,
    pub content: String,
    pub metadata: BTreeMap<String, String>,
    pub status: NotificationStatus,
    /// Failed attempts counted against `max_retries`.
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Notification {
    /// Create a new pending notification.
    pub fn new(channel: ChannelType, recipient: &str, subject: &str, content: &str) -> Self {
        NotificationPayload::new(channel, recipient, subject, content).instantiate(Utc::now())
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Sent, or failed with no retries left.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            NotificationStatus::Sent => true,
            NotificationStatus::Failed => !self.can_retry(),
            NotificationStatus::Pending => false,
        }
    }

    /// Record a successful delivery.
    pub fn mark_sent(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.is_terminal() {
            return Err(PigeonError::InvalidTransition(format!(
                "notification {} is {} and cannot be marked sent",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = NotificationStatus::Sent;
        self.sent_at = Some(at);
        Ok(())
    }

    /// Record a failed delivery attempt. The retry counter only advances
    /// while retries remain, so an exhausted notification stays at
    /// `retry_count == max_retries`.
    pub fn mark_failed(&mut self, error: &str) -> Result<()> {
        if self.status == NotificationStatus::Sent {
            return Err(PigeonError::InvalidTransition(format!(
                "notification {} was already sent",
                self.id
            )));
        }
        if self.can_retry() {
            self.retry_count += 1;
        }
        self.status = NotificationStatus::Failed;
        self.last_error = Some(error.to_string());
        Ok(())
    }
}
