use std::sync::Arc;

use anyhow::Context;
use castle_process::{LifecycleEvent, LifecycleNotification, ServerName};
use tokio::sync::broadcast;

use crate::{
    settings::{WebhookSettings, WebhookTemplates},
    support::format_error_chain,
};

const EVENT_BUFFER: usize = 256;

/// Outbound chat/webhook target.
#[async_trait::async_trait]
pub trait WebhookSink: Send + Sync {
    async fn send(&self, message: &str) -> anyhow::Result<()>;
}

/// Posts `{"content": ...}` to a Discord-compatible webhook URL.
#[derive(Debug, Clone)]
pub struct DiscordWebhook {
    url: String,
    client: reqwest::Client,
}

impl DiscordWebhook {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl WebhookSink for DiscordWebhook {
    async fn send(&self, message: &str) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(&serde_json::json!({ "content": message }))
            .send()
            .await
            .context("post webhook")?
            .error_for_status()
            .context("post webhook (status)")?;
        Ok(())
    }
}

/// Renders the webhook text for an event, or `None` when the server's
/// templates say nothing should be sent.
pub fn webhook_message(templates: &WebhookTemplates, event: &LifecycleEvent) -> Option<String> {
    if !templates.enabled {
        return None;
    }
    let template = match event {
        LifecycleEvent::Started { .. } => &templates.start_server,
        LifecycleEvent::Stopping => &templates.stop_server,
        LifecycleEvent::Restarting { .. } => &templates.server_crash,
        LifecycleEvent::GivingUp { .. } => &templates.attempt_start3,
        LifecycleEvent::Ready { ip, steam_id } => return ready_message(templates, ip, steam_id),
        _ => return None,
    };
    Some(template.clone()).filter(|t| !t.trim().is_empty())
}

fn ready_message(templates: &WebhookTemplates, ip: &str, steam_id: &str) -> Option<String> {
    let mut parts = Vec::new();
    if !templates.server_ready.trim().is_empty() {
        parts.push(templates.server_ready.clone());
    }
    if templates.broadcast_ip && !ip.is_empty() {
        parts.push(format!("Public IP: {ip}"));
    }
    if templates.broadcast_steam_id && !steam_id.is_empty() {
        parts.push(format!("SteamID: {steam_id}"));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Fans lifecycle events out to subscribers and, when configured, a webhook.
pub struct Notifier {
    events: broadcast::Sender<LifecycleNotification>,
    webhook: WebhookSettings,
    sink: Option<Arc<dyn WebhookSink>>,
}

impl Notifier {
    pub fn new(webhook: WebhookSettings, sink: Option<Arc<dyn WebhookSink>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            events,
            webhook,
            sink,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleNotification> {
        self.events.subscribe()
    }

    /// Never fails and never waits on the network; webhook delivery runs on
    /// its own task.
    pub fn publish(&self, server: &str, templates: &WebhookTemplates, event: LifecycleEvent) {
        let message = if self.webhook.enabled {
            webhook_message(templates, &event)
        } else {
            None
        };

        let _ = self.events.send(LifecycleNotification {
            server: ServerName::from(server),
            event,
        });

        let (Some(message), Some(sink)) = (message, self.sink.clone()) else {
            return;
        };
        let server = server.to_string();
        tokio::spawn(async move {
            if let Err(err) = sink.send(&message).await {
                tracing::warn!(
                    server = %server,
                    error = %format_error_chain(&err),
                    "webhook send failed"
                );
            }
        });
    }
}
