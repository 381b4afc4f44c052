//! Applying decisions.
//!
//! The engine never touches the outside world. An executor starts applying an
//! approved decision and hands back a reference; later passes poll that
//! reference and feed the final success or failure back so confidence can adjust.
//! The production executor turns the decision into a `custom` task named
//! `apply_decision`, so it is applied through the same durable queue, retry
//! and idempotency path as every other piece of work.

use async_trait::async_trait;
use leadpulse_core::clock::Clock;
use leadpulse_core::error::Result;
use leadpulse_scheduler::delivery::{Delivery, DeliveryChannel, DeliveryProvider};
use leadpulse_scheduler::handlers::{CustomAction, HandlerError, HandlerOutput, TaskContext};
use leadpulse_scheduler::{SchedulerService, TaskStatus, TaskType};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::decision::{Decision, DecisionType, Outcome};
use crate::engine::DecisionEngine;
use crate::snapshot::SnapshotSource;

/// Custom action name used for decision tasks.
pub const APPLY_DECISION: &str = "apply_decision";

/// Where an application started by [`DecisionExecutor::execute`] stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
}

#[async_trait]
pub trait DecisionExecutor: Send + Sync {
    /// Start applying the decision. Returns a reference for [`Self::status`].
    /// Calling it twice for the same decision must not apply it twice.
    async fn execute(&self, decision: &Decision) -> Result<String>;

    /// Current state of the application behind `reference`.
    async fn status(&self, reference: &str) -> Result<ExecutionState>;
}

/// Enqueues each decision as a `custom` task and reports the task's fate.
pub struct TaskQueueExecutor {
    service: Arc<SchedulerService>,
    owner_id: String,
    clock: Arc<dyn Clock>,
}

impl TaskQueueExecutor {
    pub fn new(service: Arc<SchedulerService>, owner_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            service,
            owner_id: owner_id.into(),
            clock,
        }
    }
}

/// One apply task per decision, ever.
pub fn decision_dedupe_key(decision_id: &str) -> String {
    format!("decision:{decision_id}")
}

#[async_trait]
impl DecisionExecutor for TaskQueueExecutor {
    async fn execute(&self, decision: &Decision) -> Result<String> {
        let payload = serde_json::json!({
            "name": APPLY_DECISION,
            "args": {
                "decision_id": decision.id,
                "type": decision.decision_type,
                "reasoning": decision.reasoning,
                "action": decision.action,
                "confidence": decision.confidence,
            },
        });
        self.service.schedule_unique_task(
            &self.owner_id,
            TaskType::Custom,
            payload,
            self.clock.now(),
            &decision_dedupe_key(&decision.id),
        )
    }

    async fn status(&self, reference: &str) -> Result<ExecutionState> {
        let task = self.service.task(reference)?;
        Ok(match task.status {
            TaskStatus::Pending | TaskStatus::Processing => ExecutionState::Running,
            TaskStatus::Completed => ExecutionState::Succeeded,
            TaskStatus::Failed => {
                ExecutionState::Failed(task.error.unwrap_or_else(|| "task failed".into()))
            }
            TaskStatus::Cancelled => ExecutionState::Cancelled,
        })
    }
}

/// `apply_decision` custom action: hands the decision to the operator
/// channel, where the CRM side picks it up.
pub struct ApplyDecisionAction {
    provider: Arc<dyn DeliveryProvider>,
    operator: String,
}

impl ApplyDecisionAction {
    pub fn new(provider: Arc<dyn DeliveryProvider>, operator: impl Into<String>) -> Self {
        Self {
            provider,
            operator: operator.into(),
        }
    }
}

#[async_trait]
impl CustomAction for ApplyDecisionAction {
    fn name(&self) -> &str {
        APPLY_DECISION
    }

    async fn run(&self, ctx: &TaskContext, args: &Value) -> std::result::Result<HandlerOutput, HandlerError> {
        let decision_type: DecisionType = serde_json::from_value(args["type"].clone())
            .map_err(|_| HandlerError::Configuration("missing or unknown decision 'type'".into()))?;
        let reasoning = args["reasoning"].as_str().unwrap_or_default();

        let delivery = Delivery {
            idempotency_key: ctx.idempotency_key().to_string(),
            channel: DeliveryChannel::Notification,
            recipient: self.operator.clone(),
            subject: Some(format!("Autopilot: {decision_type}")),
            body: format!("{reasoning}\n\n{}", args["action"]),
            metadata: serde_json::json!({
                "owner_id": ctx.owner_id,
                "decision_id": args["decision_id"],
                "decision_type": decision_type,
                "action": args["action"],
            }),
        };
        let receipt = self.provider.deliver(&delivery).await?;
        tracing::info!("🤖 Decision {decision_type} handed to {}", self.operator);
        Ok(HandlerOutput::with_data(serde_json::json!({
            "decision_type": decision_type,
            "dry_run": receipt.dry_run,
        })))
    }
}

/// What one autopilot pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutopilotReport {
    pub proposed: usize,
    /// Handed to the executor this pass.
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Dispatched earlier or now, outcome not known yet.
    pub in_flight: usize,
    pub awaiting_approval: usize,
}

/// Dispatch every approved decision, then settle the ones whose application
/// has finished. A decision's outcome is recorded only once its application
/// reaches a terminal state.
pub async fn execute_ready(
    engine: &DecisionEngine,
    executor: &dyn DecisionExecutor,
) -> Result<AutopilotReport> {
    let mut report = AutopilotReport::default();
    for decision in engine.ready()? {
        match executor.execute(&decision).await {
            Ok(reference) => {
                if engine.mark_executing(&decision.id, &reference)? {
                    tracing::info!("🚀 {} {} dispatched as {reference}", decision.decision_type, decision.id);
                    report.dispatched += 1;
                }
            }
            Err(e) => {
                tracing::warn!("⚠️ {} {} not dispatched: {e}", decision.decision_type, decision.id);
                settle(engine, &decision, Err(e.to_string()), &mut report);
            }
        }
    }

    for decision in engine.executing()? {
        let Some(reference) = decision.execution_ref.as_deref() else {
            continue;
        };
        match executor.status(reference).await {
            Ok(ExecutionState::Running) => report.in_flight += 1,
            Ok(ExecutionState::Succeeded) => settle(engine, &decision, Ok(()), &mut report),
            Ok(ExecutionState::Failed(error)) => {
                tracing::warn!("⚠️ {} {} failed: {error}", decision.decision_type, decision.id);
                settle(engine, &decision, Err(error), &mut report);
            }
            Ok(ExecutionState::Cancelled) => {
                if engine.mark_cancelled(&decision.id)? {
                    tracing::info!("🚫 {} {} cancelled", decision.decision_type, decision.id);
                    report.cancelled += 1;
                }
            }
            Err(e) => {
                tracing::warn!("⚠️ Status of {} unknown: {e}", decision.id);
                report.in_flight += 1;
            }
        }
    }
    report.awaiting_approval = engine.pending_count()?;
    Ok(report)
}

fn settle(
    engine: &DecisionEngine,
    decision: &Decision,
    result: std::result::Result<(), String>,
    report: &mut AutopilotReport,
) {
    let recorded = match &result {
        Ok(()) => engine.record_outcome(&decision.id, Outcome::Success),
        Err(error) => engine.record_failure(&decision.id, error),
    };
    match (recorded, result) {
        (Ok(_), Ok(())) => report.succeeded += 1,
        (Ok(_), Err(_)) => report.failed += 1,
        (Err(e), _) => tracing::warn!("⚠️ Outcome for {} not recorded: {e}", decision.id),
    }
}

/// One full pass: snapshot → rules → gate → execute.
pub async fn run_once(
    engine: &DecisionEngine,
    source: &dyn SnapshotSource,
    executor: &dyn DecisionExecutor,
) -> Result<AutopilotReport> {
    let snapshot = source.snapshot().await?;
    let proposed = engine.evaluate(&snapshot)?.len();
    let mut report = execute_ready(engine, executor).await?;
    report.proposed = proposed;
    Ok(report)
}

/// Run the autopilot forever on a fixed interval.
pub async fn spawn_autopilot(
    engine: Arc<DecisionEngine>,
    source: Arc<dyn SnapshotSource>,
    executor: Arc<dyn DecisionExecutor>,
    every: std::time::Duration,
) {
    tracing::info!("🧠 Autopilot started (every {}s)", every.as_secs());
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;
        match run_once(&engine, source.as_ref(), executor.as_ref()).await {
            Ok(report) => tracing::info!(
                "🧠 Autopilot pass: {} proposed, {} dispatched, {} succeeded, {} failed, {} in flight, {} awaiting approval",
                report.proposed,
                report.dispatched,
                report.succeeded,
                report.failed,
                report.in_flight,
                report.awaiting_approval
            ),
            Err(e) => tracing::warn!("⚠️ Autopilot pass skipped: {e}"),
        }
    }
}
