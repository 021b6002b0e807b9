//! Best-effort webhook notifications (§4.10, ambient).
//!
//! A no-op when `webhook.url` is unset. Failures are logged once and never
//! retried inline — the monitor has already moved on to the next tick by
//! the time a webhook POST would complete.

use serde::Serialize;
use tracing::warn;

use crate::config::WebhookConfig;
use crate::state_machine::NotifyEvent;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    server: &'a str,
    event: &'static str,
}

#[derive(Clone)]
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(cfg: &WebhookConfig) -> Self {
        WebhookNotifier {
            http: reqwest::Client::new(),
            url: cfg.url.clone(),
        }
    }

    pub async fn notify(&self, server_id: &str, event: NotifyEvent) {
        let Some(url) = &self.url else {
            return;
        };

        let event_name = match event {
            NotifyEvent::Started => "started",
            NotifyEvent::Stopped => "stopped",
            NotifyEvent::Crashed => "crashed",
            NotifyEvent::Quarantined => "quarantined",
        };

        let payload = WebhookPayload {
            server: server_id,
            event: event_name,
        };

        if let Err(e) = self.http.post(url).json(&payload).send().await {
            warn!(server = %server_id, event = event_name, error = %e, "webhook delivery failed");
        }
    }
}
