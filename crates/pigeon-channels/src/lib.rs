//! # Pigeon Channels
//! Reference channel providers and the registry the dispatcher routes through.
//!
//! ```text
//! Dispatcher ──► ProviderRegistry
//!                  ├── Email → SmtpEmailProvider (lettre, async SMTP)
//!                  ├── Sms   → HttpSmsProvider   (JSON POST to an SMS gateway)
//!                  └── Push  → HttpPushProvider  (JSON POST to a push gateway)
//! ```

pub mod email;
pub mod push;
pub mod registry;
pub mod sms;

pub use email::SmtpEmailProvider;
pub use push::HttpPushProvider;
pub use registry::ProviderRegistry;
pub use sms::HttpSmsProvider;

/// Pull a provider message id out of a gateway JSON response.
/// Gateways disagree on the key, so try the usual suspects.
pub(crate) fn extract_message_id(body: &serde_json::Value) -> Option<String> {
    ["message_id", "messageId", "id", "sid", "name"]
        .iter()
        .find_map(|key| match &body[*key] {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}
