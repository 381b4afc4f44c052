//! Delivery providers: the only place that talks to email/notification relays.
//!
//! Two implementations, selected by `[delivery] dry_run`:
//! - [`HttpDeliveryProvider`] POSTs JSON to the configured relay endpoints.
//! - [`DryRunProvider`] logs and records deliveries without sending anything.
//!
//! Every delivery carries the task id as its idempotency key so a redelivered
//! task does not double-send at the provider.

use async_trait::async_trait;
use leadpulse_core::config::DeliveryConfig;
use leadpulse_core::error::{LeadPulseError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Outbound channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryChannel {
    Email,
    Sms,
    Voice,
    Notification,
}

/// One message to hand to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub idempotency_key: String,
    pub channel: DeliveryChannel,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Provider-side message id, when returned.
    pub provider_id: Option<String>,
    pub dry_run: bool,
}

/// Provider failure, split by whether retrying can help.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeliveryError {
    /// Timeouts, rate limits, 5xx.
    #[error("{0}")]
    Transient(String),
    /// Invalid recipient, rejected payload, other 4xx.
    #[error("{0}")]
    Permanent(String),
}

#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, delivery: &Delivery) -> std::result::Result<DeliveryReceipt, DeliveryError>;
}

/// Build the provider the configuration asks for.
pub fn provider_from_config(config: &DeliveryConfig) -> Result<Arc<dyn DeliveryProvider>> {
    if config.dry_run {
        tracing::info!("🧪 Delivery in dry-run mode, nothing leaves this process");
        return Ok(Arc::new(DryRunProvider::new()));
    }
    Ok(Arc::new(HttpDeliveryProvider::from_config(config)?))
}

/// HTTP relay provider.
pub struct HttpDeliveryProvider {
    client: reqwest::Client,
    email_endpoint: String,
    notification_endpoint: String,
    api_key: Option<String>,
    from_address: String,
}

impl HttpDeliveryProvider {
    pub fn from_config(config: &DeliveryConfig) -> Result<Self> {
        let email_endpoint = config.email_endpoint.clone().ok_or_else(|| {
            LeadPulseError::Config("delivery.email_endpoint is not set".into())
        })?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LeadPulseError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            notification_endpoint: config
                .notification_endpoint
                .clone()
                .unwrap_or_else(|| email_endpoint.clone()),
            email_endpoint,
            api_key: config.api_key.clone(),
            from_address: config.from_address.clone(),
        })
    }

    fn endpoint_for(&self, channel: DeliveryChannel) -> &str {
        match channel {
            DeliveryChannel::Notification => &self.notification_endpoint,
            _ => &self.email_endpoint,
        }
    }
}

#[async_trait]
impl DeliveryProvider for HttpDeliveryProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn deliver(&self, delivery: &Delivery) -> std::result::Result<DeliveryReceipt, DeliveryError> {
        let body = serde_json::json!({
            "from": self.from_address,
            "to": delivery.recipient,
            "channel": delivery.channel,
            "subject": delivery.subject,
            "body": delivery.body,
            "metadata": delivery.metadata,
        });

        let mut req = self
            .client
            .post(self.endpoint_for(delivery.channel))
            .header("Idempotency-Key", &delivery.idempotency_key)
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            // connect/timeout errors are worth another attempt
            DeliveryError::Transient(format!("{} request failed: {e}", self.name()))
        })?;

        let status = resp.status();
        if status.is_success() {
            let provider_id = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v["id"].as_str().map(str::to_string));
            tracing::debug!(
                "📨 Delivered {} to {} ({})",
                delivery.idempotency_key,
                delivery.recipient,
                status
            );
            return Ok(DeliveryReceipt {
                provider_id,
                dry_run: false,
            });
        }

        let text = resp.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), &text))
    }
}

/// Map a non-success HTTP status to a failure kind.
pub fn classify_status(status: u16, body: &str) -> DeliveryError {
    let msg = format!("relay returned {status}: {body}");
    match status {
        408 | 425 | 429 => DeliveryError::Transient(msg),
        s if s >= 500 => DeliveryError::Transient(msg),
        _ => DeliveryError::Permanent(msg),
    }
}

/// Deliveries a [`DryRunProvider`] remembers by default.
pub const DRY_RUN_RETAINED: usize = 1024;

/// No-op provider: logs each delivery and keeps the most recent ones.
pub struct DryRunProvider {
    recent: Mutex<RecentDeliveries>,
}

/// Bounded window of deliveries, deduped by idempotency key.
struct RecentDeliveries {
    order: VecDeque<Delivery>,
    keys: HashSet<String>,
    capacity: usize,
}

impl RecentDeliveries {
    /// Returns false if the key is already in the window.
    fn push(&mut self, delivery: &Delivery) -> bool {
        if self.keys.contains(&delivery.idempotency_key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest.idempotency_key);
            }
        }
        self.keys.insert(delivery.idempotency_key.clone());
        self.order.push_back(delivery.clone());
        true
    }
}

impl Default for DryRunProvider {
    fn default() -> Self {
        Self::with_capacity(DRY_RUN_RETAINED)
    }
}

impl DryRunProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` deliveries (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            recent: Mutex::new(RecentDeliveries {
                order: VecDeque::with_capacity(capacity.min(DRY_RUN_RETAINED)),
                keys: HashSet::new(),
                capacity,
            }),
        }
    }

    /// The retained deliveries, oldest first.
    pub fn deliveries(&self) -> Vec<Delivery> {
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.order.iter().cloned().collect()
    }
}

#[async_trait]
impl DeliveryProvider for DryRunProvider {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn deliver(&self, delivery: &Delivery) -> std::result::Result<DeliveryReceipt, DeliveryError> {
        tracing::info!(
            "🧪 [dry-run] {:?} → {} | {} (key {})",
            delivery.channel,
            delivery.recipient,
            delivery.subject.as_deref().unwrap_or("-"),
            delivery.idempotency_key
        );
        // same key twice is the same message
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(delivery);
        Ok(DeliveryReceipt {
            provider_id: None,
            dry_run: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(key: &str) -> Delivery {
        Delivery {
            idempotency_key: key.into(),
            channel: DeliveryChannel::Email,
            recipient: "ana@example.com".into(),
            subject: Some("Hello".into()),
            body: "Hi Ana".into(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(classify_status(429, ""), DeliveryError::Transient(_)));
        assert!(matches!(classify_status(503, ""), DeliveryError::Transient(_)));
        assert!(matches!(classify_status(408, ""), DeliveryError::Transient(_)));
        assert!(matches!(classify_status(400, ""), DeliveryError::Permanent(_)));
        assert!(matches!(classify_status(422, "bad address"), DeliveryError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_dry_run_dedupes_by_key() {
        let provider = DryRunProvider::new();
        let receipt = provider.deliver(&delivery("task-1")).await.unwrap();
        assert!(receipt.dry_run);
        provider.deliver(&delivery("task-1")).await.unwrap();
        provider.deliver(&delivery("task-2")).await.unwrap();
        assert_eq!(provider.deliveries().len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_retains_a_bounded_window() {
        let provider = DryRunProvider::with_capacity(2);
        for key in ["task-1", "task-2", "task-3"] {
            provider.deliver(&delivery(key)).await.unwrap();
        }
        let keys: Vec<String> = provider
            .deliveries()
            .into_iter()
            .map(|d| d.idempotency_key)
            .collect();
        assert_eq!(keys, vec!["task-2", "task-3"]);

        // evicted keys are forgotten, retained ones still dedupe
        provider.deliver(&delivery("task-3")).await.unwrap();
        provider.deliver(&delivery("task-1")).await.unwrap();
        let keys: Vec<String> = provider
            .deliveries()
            .into_iter()
            .map(|d| d.idempotency_key)
            .collect();
        assert_eq!(keys, vec!["task-3", "task-1"]);
    }

    #[test]
    fn test_provider_from_config() {
        let config = DeliveryConfig::default();
        assert_eq!(provider_from_config(&config).unwrap().name(), "dry-run");

        let mut config = DeliveryConfig::default();
        config.dry_run = false;
        assert!(provider_from_config(&config).is_err());

        config.email_endpoint = Some("http://127.0.0.1:9/send".into());
        assert_eq!(provider_from_config(&config).unwrap().name(), "http");
    }
}
