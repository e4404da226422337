//! Email provider — async SMTP via lettre.
//!
//! Supports Gmail, Outlook, and any STARTTLS relay. The provider stamps its
//! own `Message-ID` so the delivery log can correlate bounces later.

use std::collections::BTreeMap;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use pigeon_core::config::EmailConfig;
use pigeon_core::error::{PigeonError, Result};
use pigeon_core::traits::{EmailProvider, SendResult};

/// SMTP email provider.
pub struct SmtpEmailProvider {
    from: Mailbox,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpEmailProvider {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let from = from_mailbox(config)?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| PigeonError::Config(format!("SMTP relay: {e}")))?
            .port(config.smtp_port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }

        tracing::info!("📧 SMTP provider ready: {}:{}", config.smtp_host, config.smtp_port);
        Ok(Self {
            from,
            mailer: builder.build(),
        })
    }

    fn build_message(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        is_html: bool,
        metadata: &BTreeMap<String, String>,
        message_id: &str,
    ) -> std::result::Result<Message, String> {
        let to_mailbox: Mailbox = to.parse().map_err(|e| format!("Invalid to: {e}"))?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to_mailbox)
            .subject(subject)
            .message_id(Some(message_id.to_string()))
            .header(if is_html {
                ContentType::TEXT_HTML
            } else {
                ContentType::TEXT_PLAIN
            });

        if let Some(reply_to) = metadata.get("reply_to") {
            let mailbox: Mailbox = reply_to
                .parse()
                .map_err(|e| format!("Invalid reply_to: {e}"))?;
            builder = builder.reply_to(mailbox);
        }

        builder
            .body(body.to_string())
            .map_err(|e| format!("Build email: {e}"))
    }

    fn new_message_id(&self) -> String {
        format!("<{}@{}>", uuid::Uuid::new_v4(), self.from.email.domain())
    }
}

fn from_mailbox(config: &EmailConfig) -> Result<Mailbox> {
    let raw = match &config.from_name {
        Some(name) => format!("{name} <{}>", config.from_address),
        None => config.from_address.clone(),
    };
    raw.parse()
        .map_err(|e| PigeonError::Config(format!("Invalid from: {e}")))
}

#[async_trait]
impl EmailProvider for SmtpEmailProvider {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        is_html: bool,
        metadata: &BTreeMap<String, String>,
    ) -> Result<SendResult> {
        let message_id = self.new_message_id();
        let email = match self.build_message(to, subject, body, is_html, metadata, &message_id) {
            Ok(email) => email,
            // Bad addresses will never succeed; report rather than raise.
            Err(reason) => return Ok(SendResult::failed(reason)),
        };

        match self.mailer.send(email).await {
            Ok(_) => {
                tracing::info!("📤 Email sent to: {to}");
                Ok(SendResult::ok(message_id))
            }
            Err(e) if e.is_permanent() || e.is_transient() => {
                tracing::warn!("⚠️ SMTP rejected mail to {to}: {e}");
                Ok(SendResult::failed(format!("SMTP rejected: {e}")))
            }
            Err(e) => Err(PigeonError::Provider(format!("SMTP send: {e}"))),
        }
    }
}
