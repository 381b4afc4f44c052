//! Scheduled task model: types, statuses and the persisted row.

use chrono::{DateTime, Utc};
use leadpulse_core::error::LeadPulseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What kind of work a task performs. Selects the action handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    SendEmail,
    UpdateLeadScore,
    SendNotification,
    /// Internal: advance one enrollment by one drip step.
    AdvanceDripStep,
    Custom,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SendEmail => "send-email",
            TaskType::UpdateLeadScore => "update-lead-score",
            TaskType::SendNotification => "send-notification",
            TaskType::AdvanceDripStep => "advance-drip-step",
            TaskType::Custom => "custom",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = LeadPulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send-email" => Ok(TaskType::SendEmail),
            "update-lead-score" => Ok(TaskType::UpdateLeadScore),
            "send-notification" => Ok(TaskType::SendNotification),
            "advance-drip-step" => Ok(TaskType::AdvanceDripStep),
            "custom" => Ok(TaskType::Custom),
            other => Err(LeadPulseError::Validation(format!("unknown task type '{other}'"))),
        }
    }
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = LeadPulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(LeadPulseError::Store(format!("unknown task status '{other}'"))),
        }
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    /// Tenant / company the work belongs to.
    pub owner_id: String,
    pub task_type: TaskType,
    /// Interpreted by the handler for `task_type`.
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub scheduled_for: DateTime<Utc>,
    /// Set while `processing`.
    pub claimed_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    /// Last failure message.
    pub error: Option<String>,
    /// Handler output on success.
    pub output: Option<serde_json::Value>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// External cancel arrived while the task was `processing`.
    pub cancel_requested: bool,
    pub dedupe_key: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert request for a new `pending` task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub owner_id: String,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub scheduled_for: DateTime<Utc>,
    pub max_retries: u32,
    pub created_by: String,
    /// At most one task may carry a given key.
    pub dedupe_key: Option<String>,
}

impl NewTask {
    pub fn new(
        owner_id: &str,
        task_type: TaskType,
        payload: serde_json::Value,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            task_type,
            payload,
            scheduled_for,
            max_retries: 3,
            created_by: "system".to_string(),
            dedupe_key: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn created_by(mut self, who: &str) -> Self {
        self.created_by = who.to_string();
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Result of an external cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Was `pending`, now `cancelled`.
    Cancelled,
    /// Was `processing`; the current attempt finishes and is not retried.
    CancelRequested,
    /// Already terminal, nothing changed.
    AlreadyFinished(TaskStatus),
}
