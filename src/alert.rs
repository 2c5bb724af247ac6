//! Outage alerting over an events webhook.
//!
//! The hibernation path raises one alert per sustained network outage and
//! resolves it when polling recovers. Payloads follow the Events API v2
//! shape (`routing_key` / `event_action` / `dedup_key`).

use crate::config::AlertingConfig;
use crate::log_debug;

pub const DEFAULT_ALERT_ENDPOINT: &str = "https://events.pagerduty.com/v2/enqueue";

/// Alert delivery seam. The scheduler only ever triggers and resolves; alert
/// lifecycle dedup happens server-side via `dedup_key`.
pub trait Alerter: Send + Sync {
    fn trigger(
        &self,
        routing_key: &str,
        dedup_key: &str,
        summary: &str,
        reason: &str,
        details: &str,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;

    fn resolve(
        &self,
        routing_key: &str,
        dedup_key: &str,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;
}

/// Stands in when no routing key is configured.
pub struct NoopAlerter;

impl Alerter for NoopAlerter {
    async fn trigger(
        &self,
        _routing_key: &str,
        dedup_key: &str,
        summary: &str,
        _reason: &str,
        _details: &str,
    ) -> Result<(), String> {
        log_debug!("alerting unconfigured; dropping alert '{}' ({})", dedup_key, summary);
        Ok(())
    }

    async fn resolve(&self, _routing_key: &str, dedup_key: &str) -> Result<(), String> {
        log_debug!("alerting unconfigured; dropping resolve for '{}'", dedup_key);
        Ok(())
    }
}

/// Posts trigger/resolve events to the configured webhook endpoint.
pub struct WebhookAlerter {
    endpoint: String,
    client: reqwest::Client,
}

impl WebhookAlerter {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }

    async fn post_event(&self, body: &serde_json::Value) -> Result<(), String> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| format!("Alert webhook request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(format!(
                "Alert webhook returned {}: {}",
                status,
                detail.trim()
            ));
        }
        Ok(())
    }
}

impl Alerter for WebhookAlerter {
    async fn trigger(
        &self,
        routing_key: &str,
        dedup_key: &str,
        summary: &str,
        reason: &str,
        details: &str,
    ) -> Result<(), String> {
        let body = serde_json::json!({
            "routing_key": routing_key,
            "event_action": "trigger",
            "dedup_key": dedup_key,
            "payload": {
                "summary": summary,
                "source": "drover",
                "severity": "error",
                "custom_details": {
                    "reason": reason,
                    "details": details,
                },
            },
        });
        self.post_event(&body).await
    }

    async fn resolve(&self, routing_key: &str, dedup_key: &str) -> Result<(), String> {
        let body = serde_json::json!({
            "routing_key": routing_key,
            "event_action": "resolve",
            "dedup_key": dedup_key,
        });
        self.post_event(&body).await
    }
}

/// Either production sink, picked by configuration.
pub enum AnyAlerter {
    Webhook(WebhookAlerter),
    Noop(NoopAlerter),
}

impl Alerter for AnyAlerter {
    async fn trigger(
        &self,
        routing_key: &str,
        dedup_key: &str,
        summary: &str,
        reason: &str,
        details: &str,
    ) -> Result<(), String> {
        match self {
            AnyAlerter::Webhook(a) => {
                a.trigger(routing_key, dedup_key, summary, reason, details).await
            }
            AnyAlerter::Noop(a) => {
                a.trigger(routing_key, dedup_key, summary, reason, details).await
            }
        }
    }

    async fn resolve(&self, routing_key: &str, dedup_key: &str) -> Result<(), String> {
        match self {
            AnyAlerter::Webhook(a) => a.resolve(routing_key, dedup_key).await,
            AnyAlerter::Noop(a) => a.resolve(routing_key, dedup_key).await,
        }
    }
}

/// Webhook sink when a routing key is configured, no-op otherwise.
pub fn build_alerter(config: &AlertingConfig) -> AnyAlerter {
    if config.routing_key.is_some() {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ALERT_ENDPOINT.to_string());
        AnyAlerter::Webhook(WebhookAlerter::new(endpoint))
    } else {
        AnyAlerter::Noop(NoopAlerter)
    }
}
