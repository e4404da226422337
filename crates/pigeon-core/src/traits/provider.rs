//! Channel provider contracts.
//!
//! A provider reports an ordinary delivery failure through
//! [`SendResult::failed`]; an `Err` means the provider itself blew up.
//! The dispatcher treats both the same way.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Outcome reported by a channel provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl SendResult {
    pub fn ok(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait EmailProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        is_html: bool,
        metadata: &BTreeMap<String, String>,
    ) -> Result<SendResult>;
}

#[async_trait]
pub trait SmsProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        to: &str,
        body: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<SendResult>;
}

#[async_trait]
pub trait PushProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        device_token: &str,
        title: &str,
        body: &str,
        data: Option<&serde_json::Value>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<SendResult>;
}
