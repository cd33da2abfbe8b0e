use crate::alerts::{Alert, NotificationSink};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Fans an alert out to every configured sink. With no sinks configured,
/// alerts are suppressed rather than attempted.
#[derive(Default, Clone)]
pub struct Notifier {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }
}

impl NotificationSink for Notifier {
    fn name(&self) -> &'static str {
        "notifier"
    }

    fn dispatch(&self, alert: &Alert) {
        if self.sinks.is_empty() {
            debug!(rule = %alert.rule_id, "no notification sink configured, alert suppressed");
            return;
        }
        for sink in &self.sinks {
            sink.dispatch(alert);
        }
    }
}

#[derive(Serialize)]
struct WebhookBody {
    content: String,
}

/// Posts `{"content": ...}` to a chat-style webhook (Discord and compatible).
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl NotificationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn dispatch(&self, alert: &Alert) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(rule = %alert.rule_id, "no async runtime, webhook alert dropped");
            return;
        };
        let request = self
            .client
            .post(&self.url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(&WebhookBody {
                content: alert.markdown(),
            });
        let rule = alert.rule_id.clone();
        handle.spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(rule = %rule, "webhook alert delivered");
                }
                Ok(resp) => {
                    warn!(rule = %rule, status = %resp.status(), "webhook rejected alert");
                }
                Err(err) => {
                    warn!(rule = %rule, error = %err, "webhook alert delivery failed");
                }
            }
        });
    }
}
