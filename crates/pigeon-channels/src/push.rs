//! Push provider — JSON POST to an HTTP push gateway (FCM-style body).

use std::collections::BTreeMap;

use async_trait::async_trait;
use pigeon_core::config::PushConfig;
use pigeon_core::error::{PigeonError, Result};
use pigeon_core::traits::{PushProvider, SendResult};

pub struct HttpPushProvider {
    config: PushConfig,
    client: reqwest::Client,
}

impl HttpPushProvider {
    pub fn new(config: PushConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn payload(
        device_token: &str,
        title: &str,
        body: &str,
        data: Option<&serde_json::Value>,
        metadata: &BTreeMap<String, String>,
    ) -> serde_json::Value {
        // Metadata rides along in `data` unless the caller supplied its own.
        let data = match data {
            Some(d) => d.clone(),
            None => serde_json::json!(metadata),
        };
        serde_json::json!({
            "to": device_token,
            "notification": {
                "title": title,
                "body": body,
            },
            "data": data,
        })
    }
}

#[async_trait]
impl PushProvider for HttpPushProvider {
    fn name(&self) -> &str {
        "http-push"
    }

    async fn send(
        &self,
        device_token: &str,
        title: &str,
        body: &str,
        data: Option<&serde_json::Value>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<SendResult> {
        let mut req = self
            .client
            .post(&self.config.endpoint)
            .json(&Self::payload(device_token, title, body, data, metadata))
            .timeout(std::time::Duration::from_secs(self.config.timeout_secs));
        if !self.config.server_key.is_empty() {
            req = req.bearer_auth(&self.config.server_key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| PigeonError::Provider(format!("Push send failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            let json: serde_json::Value = resp.json().await.unwrap_or_default();
            let message_id = crate::extract_message_id(&json)
                .unwrap_or_else(|| format!("push-{}", uuid::Uuid::new_v4()));
            tracing::info!("✅ Push sent: {title} ({message_id})");
            Ok(SendResult::ok(message_id))
        } else {
            let body = resp.text().await.unwrap_or_default();
            Ok(SendResult::failed(format!("Push gateway error {status}: {body}")))
        }
    }
}
