//! Listing messages and the messaging channels that deliver them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flatwatch_core::{ChannelOutcome, Listing};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("channel rejected message: {0}")]
    Rejected(String),
}

/// Outbound messaging collaborator.
#[async_trait]
pub trait MessagingChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, recipient_id: &str, text: &str) -> Result<ChannelOutcome, ChannelError>;
}

/// Telegram Bot API `sendMessage`; recipient ids are chat ids.
pub struct TelegramChannel {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
}

impl TelegramChannel {
    pub fn new(token: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: TELEGRAM_API.to_string(),
            token: token.into(),
        })
    }

    /// Point at a different Bot API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl MessagingChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, recipient_id: &str, text: &str) -> Result<ChannelOutcome, ChannelError> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let body = serde_json::json!({
            "chat_id": recipient_id,
            "text": text,
            "disable_web_page_preview": false,
        });
        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        let parsed: TelegramResponse = resp.json().await?;
        if !status.is_success() || !parsed.ok {
            return Err(ChannelError::Rejected(
                parsed
                    .description
                    .unwrap_or_else(|| format!("http status {}", status.as_u16())),
            ));
        }
        Ok(ChannelOutcome {
            channel: self.name().to_string(),
            message_ref: parsed.result.map(|m| m.message_id.to_string()),
        })
    }
}

/// Writes messages to the log instead of sending them.
#[derive(Debug, Default)]
pub struct ConsoleChannel;

#[async_trait]
impl MessagingChannel for ConsoleChannel {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn send(&self, recipient_id: &str, text: &str) -> Result<ChannelOutcome, ChannelError> {
        info!(recipient_id, "\n{text}");
        Ok(ChannelOutcome {
            channel: self.name().to_string(),
            message_ref: None,
        })
    }
}

pub fn format_message(listing: &Listing) -> String {
    let mut lines = vec![format!("New listing: {}", listing.title)];
    lines.push(match listing.price {
        Some(price) => format!("Price: {price} €"),
        None => "Price: on request".to_string(),
    });
    if let Some(size) = listing.size {
        lines.push(format!("Size: {size} m²"));
    }
    if let Some(rooms) = &listing.rooms {
        lines.push(format!("Rooms: {rooms}"));
    }
    if let Some(location) = &listing.location {
        lines.push(format!("Location: {location}"));
    }
    lines.push(String::new());
    lines.push(listing.url.clone());
    lines.join("\n")
}

/// Formats listings and hands them to the channel. A failed send is logged and reported as
/// `None`; it is never retried here.
#[derive(Clone)]
pub struct Dispatcher {
    channel: Arc<dyn MessagingChannel>,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn MessagingChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<dyn MessagingChannel> {
        &self.channel
    }

    pub async fn dispatch(&self, recipient_id: &str, listing: &Listing) -> Option<ChannelOutcome> {
        self.send_text(recipient_id, &format_message(listing)).await
    }

    pub async fn send_text(&self, recipient_id: &str, text: &str) -> Option<ChannelOutcome> {
        match self.channel.send(recipient_id, text).await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                warn!(recipient_id, channel = self.channel.name(), error = %err, "send failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use flatwatch_core::Source;

    fn listing(price: Option<i64>) -> Listing {
        Listing {
            source: Source::Immowelt,
            external_id: "immowelt_2b8kq5a".into(),
            content_hash: "h".into(),
            title: "Moderne 3-Zimmer-Wohnung".into(),
            price,
            size: Some(78),
            rooms: Some("3".into()),
            location: None,
            description: String::new(),
            url: "https://www.immowelt.de/expose/2b8kq5a".into(),
            date_posted: None,
            date_found: Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn message_lists_present_fields() {
        let text = format_message(&listing(Some(1180)));
        assert_eq!(
            text,
            "New listing: Moderne 3-Zimmer-Wohnung\nPrice: 1180 €\nSize: 78 m²\nRooms: 3\n\nhttps://www.immowelt.de/expose/2b8kq5a"
        );
        assert!(format_message(&listing(None)).contains("Price: on request"));
    }

    struct Refusing;

    #[async_trait]
    impl MessagingChannel for Refusing {
        fn name(&self) -> &'static str {
            "refusing"
        }

        async fn send(&self, _: &str, _: &str) -> Result<ChannelOutcome, ChannelError> {
            Err(ChannelError::Rejected("chat not found".into()))
        }
    }

    #[tokio::test]
    async fn failed_send_is_reported_as_none() {
        let dispatcher = Dispatcher::new(Arc::new(Refusing));
        assert!(dispatcher.dispatch("42", &listing(Some(1))).await.is_none());

        let console = Dispatcher::new(Arc::new(ConsoleChannel));
        let outcome = console.dispatch("42", &listing(Some(1))).await.unwrap();
        assert_eq!(outcome.channel, "console");
    }
}
