//! SMS provider — JSON POST to an HTTP SMS gateway.

use std::collections::BTreeMap;

use async_trait::async_trait;
use pigeon_core::config::SmsConfig;
use pigeon_core::error::{PigeonError, Result};
use pigeon_core::traits::{SendResult, SmsProvider};

pub struct HttpSmsProvider {
    config: SmsConfig,
    client: reqwest::Client,
}

impl HttpSmsProvider {
    pub fn new(config: SmsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn payload(&self, to: &str, body: &str, metadata: &BTreeMap<String, String>) -> serde_json::Value {
        serde_json::json!({
            "to": to,
            "from": self.config.sender,
            "body": body,
            "metadata": metadata,
        })
    }
}

#[async_trait]
impl SmsProvider for HttpSmsProvider {
    fn name(&self) -> &str {
        "http-sms"
    }

    async fn send(
        &self,
        to: &str,
        body: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<SendResult> {
        let mut req = self
            .client
            .post(&self.config.endpoint)
            .json(&self.payload(to, body, metadata))
            .timeout(std::time::Duration::from_secs(self.config.timeout_secs));
        if !self.config.api_key.is_empty() {
            req = req.bearer_auth(&self.config.api_key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| PigeonError::Provider(format!("SMS send failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            let json: serde_json::Value = resp.json().await.unwrap_or_default();
            let message_id = crate::extract_message_id(&json)
                .unwrap_or_else(|| format!("sms-{}", uuid::Uuid::new_v4()));
            tracing::info!("✅ SMS sent to {to} ({message_id})");
            Ok(SendResult::ok(message_id))
        } else {
            let body = resp.text().await.unwrap_or_default();
            Ok(SendResult::failed(format!("SMS gateway error {status}: {body}")))
        }
    }
}
