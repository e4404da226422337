//! Provider registry — one optional provider per channel.

use std::sync::Arc;

use pigeon_core::config::PigeonConfig;
use pigeon_core::error::Result;
use pigeon_core::traits::{EmailProvider, PushProvider, SmsProvider};
use pigeon_core::types::ChannelType;

use crate::{HttpPushProvider, HttpSmsProvider, SmtpEmailProvider};

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    email: Option<Arc<dyn EmailProvider>>,
    sms: Option<Arc<dyn SmsProvider>>,
    push: Option<Arc<dyn PushProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_email(mut self, provider: Arc<dyn EmailProvider>) -> Self {
        self.email = Some(provider);
        self
    }

    pub fn with_sms(mut self, provider: Arc<dyn SmsProvider>) -> Self {
        self.sms = Some(provider);
        self
    }

    pub fn with_push(mut self, provider: Arc<dyn PushProvider>) -> Self {
        self.push = Some(provider);
        self
    }

    pub fn email(&self) -> Option<&Arc<dyn EmailProvider>> {
        self.email.as_ref()
    }

    pub fn sms(&self) -> Option<&Arc<dyn SmsProvider>> {
        self.sms.as_ref()
    }

    pub fn push(&self) -> Option<&Arc<dyn PushProvider>> {
        self.push.as_ref()
    }

    /// Channels that have a provider behind them.
    pub fn configured_channels(&self) -> Vec<ChannelType> {
        let mut channels = Vec::new();
        if self.email.is_some() {
            channels.push(ChannelType::Email);
        }
        if self.sms.is_some() {
            channels.push(ChannelType::Sms);
        }
        if self.push.is_some() {
            channels.push(ChannelType::Push);
        }
        channels
    }

    /// Build providers for every channel section present in the config.
    /// Called at startup; channels without a section stay unconfigured and
    /// their notifications fail fast at dispatch time.
    pub fn from_config(config: &PigeonConfig) -> Result<Self> {
        let mut registry = Self::new();

        if let Some(email) = &config.email {
            registry = registry.with_email(Arc::new(SmtpEmailProvider::new(email)?));
        }
        if let Some(sms) = &config.sms {
            registry = registry.with_sms(Arc::new(HttpSmsProvider::new(sms.clone())));
        }
        if let Some(push) = &config.push {
            registry = registry.with_push(Arc::new(HttpPushProvider::new(push.clone())));
        }

        if registry.configured_channels().is_empty() {
            tracing::warn!("⚠️ No channel providers configured, every delivery will fail");
        }
        Ok(registry)
    }
}
