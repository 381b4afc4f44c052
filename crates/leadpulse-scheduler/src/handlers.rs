//! Action handlers: one per task type.
//!
//! A handler receives the task payload and returns either an output or a
//! typed failure. Handlers never touch task status; the dispatcher feeds the
//! result through [`crate::retry::decide`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::delivery::{Delivery, DeliveryChannel, DeliveryError, DeliveryProvider};
use crate::drip::{AdvanceDripStepHandler, CampaignCatalog};
use crate::persistence::SchedulerDb;
use crate::retry::FailureKind;
use crate::tasks::TaskType;

/// Handler failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// Missing or malformed payload; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl HandlerError {
    pub fn kind(&self) -> FailureKind {
        match self {
            HandlerError::Transient(_) => FailureKind::Transient,
            HandlerError::Permanent(_) | HandlerError::Configuration(_) => FailureKind::Permanent,
        }
    }
}

impl From<DeliveryError> for HandlerError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::Transient(msg) => HandlerError::Transient(msg),
            DeliveryError::Permanent(msg) => HandlerError::Permanent(msg),
        }
    }
}

/// Successful handler result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    pub data: Option<Value>,
    /// Set when the handler decided the work no longer applies.
    pub suppressed: Option<String>,
}

impl HandlerOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_data(data: Value) -> Self {
        Self {
            data: Some(data),
            suppressed: None,
        }
    }

    pub fn suppressed(reason: impl Into<String>) -> Self {
        Self {
            data: None,
            suppressed: Some(reason.into()),
        }
    }

    /// What gets persisted in the task's `output` column.
    pub fn to_json(&self) -> Option<Value> {
        match (&self.data, &self.suppressed) {
            (_, Some(reason)) => Some(serde_json::json!({ "suppressed": reason })),
            (Some(data), None) => Some(data.clone()),
            (None, None) => None,
        }
    }
}

/// Per-attempt information passed to handlers.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub owner_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub now: DateTime<Utc>,
}

impl TaskContext {
    /// Idempotency key handed to providers and ledgers.
    pub fn idempotency_key(&self) -> &str {
        &self.task_id
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn handle(&self, ctx: &TaskContext, payload: &Value) -> Result<HandlerOutput, HandlerError>;
}

/// Named action run by the `custom` task type.
#[async_trait]
pub trait CustomAction: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &TaskContext, args: &Value) -> Result<HandlerOutput, HandlerError>;
}

/// Task type → handler lookup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The production handler set for every task type.
    pub fn standard(
        db: Arc<SchedulerDb>,
        catalog: Arc<CampaignCatalog>,
        provider: Arc<dyn DeliveryProvider>,
        custom: CustomHandler,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SendEmailHandler::new(provider.clone())));
        registry.register(Arc::new(SendNotificationHandler::new(provider.clone())));
        registry.register(Arc::new(UpdateLeadScoreHandler::new(db.clone())));
        registry.register(Arc::new(AdvanceDripStepHandler::new(db, catalog, provider)));
        registry.register(Arc::new(custom));
        registry
    }

    /// Add or replace the handler for its task type.
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.task_type(), handler);
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Read a required string field from a payload.
pub fn required_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, HandlerError> {
    payload[field]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| HandlerError::Configuration(format!("missing '{field}' in payload")))
}

fn optional_str(payload: &Value, field: &str) -> Option<String> {
    payload[field].as_str().map(str::to_string)
}

// ─── send-email ─────────────────────────────────────────────

/// Payload: `{"to", "subject", "body"}`.
pub struct SendEmailHandler {
    provider: Arc<dyn DeliveryProvider>,
}

impl SendEmailHandler {
    pub fn new(provider: Arc<dyn DeliveryProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ActionHandler for SendEmailHandler {
    fn task_type(&self) -> TaskType {
        TaskType::SendEmail
    }

    async fn handle(&self, ctx: &TaskContext, payload: &Value) -> Result<HandlerOutput, HandlerError> {
        let delivery = Delivery {
            idempotency_key: ctx.idempotency_key().to_string(),
            channel: DeliveryChannel::Email,
            recipient: required_str(payload, "to")?.to_string(),
            subject: Some(required_str(payload, "subject")?.to_string()),
            body: required_str(payload, "body")?.to_string(),
            metadata: serde_json::json!({ "owner_id": ctx.owner_id }),
        };
        let receipt = self.provider.deliver(&delivery).await?;
        tracing::info!("📧 Email sent to {} (task {})", delivery.recipient, ctx.task_id);
        Ok(HandlerOutput::with_data(serde_json::json!({
            "provider": self.provider.name(),
            "provider_id": receipt.provider_id,
            "dry_run": receipt.dry_run,
        })))
    }
}

// ─── send-notification ──────────────────────────────────────

/// Payload: `{"recipient", "message", "channel"?, "title"?}`.
/// `channel` is one of email/sms/voice/notification (default notification).
pub struct SendNotificationHandler {
    provider: Arc<dyn DeliveryProvider>,
}

impl SendNotificationHandler {
    pub fn new(provider: Arc<dyn DeliveryProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ActionHandler for SendNotificationHandler {
    fn task_type(&self) -> TaskType {
        TaskType::SendNotification
    }

    async fn handle(&self, ctx: &TaskContext, payload: &Value) -> Result<HandlerOutput, HandlerError> {
        let channel = match payload.get("channel") {
            None | Some(Value::Null) => DeliveryChannel::Notification,
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|_| HandlerError::Configuration(format!("unknown channel {v}")))?,
        };
        let delivery = Delivery {
            idempotency_key: ctx.idempotency_key().to_string(),
            channel,
            recipient: required_str(payload, "recipient")?.to_string(),
            subject: optional_str(payload, "title"),
            body: required_str(payload, "message")?.to_string(),
            metadata: serde_json::json!({ "owner_id": ctx.owner_id }),
        };
        let receipt = self.provider.deliver(&delivery).await?;
        tracing::info!(
            "🔔 Notification ({:?}) sent to {} (task {})",
            channel,
            delivery.recipient,
            ctx.task_id
        );
        Ok(HandlerOutput::with_data(serde_json::json!({
            "provider_id": receipt.provider_id,
            "dry_run": receipt.dry_run,
        })))
    }
}

// ─── update-lead-score ──────────────────────────────────────

/// Payload: `{"contact_id", "delta"}`. Applied once per task id.
pub struct UpdateLeadScoreHandler {
    db: Arc<SchedulerDb>,
}

impl UpdateLeadScoreHandler {
    pub fn new(db: Arc<SchedulerDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ActionHandler for UpdateLeadScoreHandler {
    fn task_type(&self) -> TaskType {
        TaskType::UpdateLeadScore
    }

    async fn handle(&self, ctx: &TaskContext, payload: &Value) -> Result<HandlerOutput, HandlerError> {
        let contact_id = required_str(payload, "contact_id")?;
        let delta = payload["delta"]
            .as_i64()
            .ok_or_else(|| HandlerError::Configuration("missing integer 'delta' in payload".into()))?;

        let score = self
            .db
            .apply_lead_score(contact_id, delta, ctx.idempotency_key(), ctx.now)
            .map_err(|e| match e {
                leadpulse_core::LeadPulseError::NotFound(what) => {
                    HandlerError::Permanent(format!("{what} not found"))
                }
                other => HandlerError::Transient(other.to_string()),
            })?;
        tracing::info!("📈 Lead score for {contact_id} is now {score} (Δ{delta})");
        Ok(HandlerOutput::with_data(serde_json::json!({
            "contact_id": contact_id,
            "lead_score": score,
        })))
    }
}

// ─── custom ─────────────────────────────────────────────────

/// Payload: `{"name", "args"?}`, dispatched to a registered [`CustomAction`].
#[derive(Default, Clone)]
pub struct CustomHandler {
    actions: HashMap<String, Arc<dyn CustomAction>>,
}

impl CustomHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_action(mut self, action: Arc<dyn CustomAction>) -> Self {
        self.actions.insert(action.name().to_string(), action);
        self
    }

    pub fn action_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ActionHandler for CustomHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Custom
    }

    async fn handle(&self, ctx: &TaskContext, payload: &Value) -> Result<HandlerOutput, HandlerError> {
        let name = required_str(payload, "name")?;
        let action = self
            .actions
            .get(name)
            .ok_or_else(|| HandlerError::Permanent(format!("no custom action named '{name}'")))?;
        let args = payload.get("args").cloned().unwrap_or(Value::Null);
        action.run(ctx, &args).await
    }
}
