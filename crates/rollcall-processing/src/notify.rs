use async_trait::async_trait;
use rollcall_core::types::Event;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Tells a human that processing an event failed.
#[async_trait]
pub trait ErrorNotifier: Send + Sync {
    async fn notify(&self, event: &Event, error: &str) -> Result<()>;
}

/// POSTs `{ text, event_id, event_name, error }` to a webhook URL.
///
/// The `text` field makes the payload readable as-is by Slack- and
/// Discord-style incoming webhooks.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl ErrorNotifier for WebhookNotifier {
    async fn notify(&self, event: &Event, error: &str) -> Result<()> {
        let body = json!({
            "text": format!("Processing failed for \"{}\" ({}): {}", event.name, event.id, error),
            "event_id": event.id,
            "event_name": event.name,
            "error": error,
        });

        let resp = self.client.post(&self.url).json(&body).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            warn!(status, event_id = %event.id, "error webhook rejected notification");
            return Err(DeliveryError::Webhook { status });
        }
        debug!(event_id = %event.id, "error notification sent");
        Ok(())
    }
}
