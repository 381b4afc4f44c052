//! Decisions: proposed autonomous actions and their lifecycle.
//!
//! ```text
//! PendingApproval ──approve──▶ Approved ──dispatch──▶ Executing ──▶ Succeeded | Failed | Cancelled
//!        │                         │
//!        ├──reject──▶ Rejected      └──outcome──▶ Succeeded | Failed
//!        └──ttl / cap──▶ Expired
//! ```

use chrono::{DateTime, Utc};
use leadpulse_core::error::LeadPulseError;
use leadpulse_scheduler::DecisionRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    CreateCampaign,
    PauseCampaign,
    AssignAgent,
    ScaleResources,
    OptimizeStrategy,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::CreateCampaign => "create_campaign",
            DecisionType::PauseCampaign => "pause_campaign",
            DecisionType::AssignAgent => "assign_agent",
            DecisionType::ScaleResources => "scale_resources",
            DecisionType::OptimizeStrategy => "optimize_strategy",
        }
    }
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionType {
    type Err = LeadPulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_campaign" => Ok(DecisionType::CreateCampaign),
            "pause_campaign" => Ok(DecisionType::PauseCampaign),
            "assign_agent" => Ok(DecisionType::AssignAgent),
            "scale_resources" => Ok(DecisionType::ScaleResources),
            "optimize_strategy" => Ok(DecisionType::OptimizeStrategy),
            other => Err(LeadPulseError::Store(format!("unknown decision type '{other}'"))),
        }
    }
}

/// What a rule emits before the engine assigns id, time and final confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub decision_type: DecisionType,
    pub reasoning: String,
    pub action: serde_json::Value,
    pub confidence: f64,
}

impl Proposal {
    pub fn new(
        decision_type: DecisionType,
        confidence: f64,
        reasoning: impl Into<String>,
        action: serde_json::Value,
    ) -> Self {
        Self {
            decision_type,
            reasoning: reasoning.into(),
            action,
            confidence,
        }
    }

    /// Two proposals with the same type and action are the same decision.
    /// `serde_json` maps are ordered, so the action text is canonical.
    pub fn fingerprint(&self) -> String {
        format!("{}:{}", self.decision_type, self.action)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    /// Below the auto-execute threshold; waiting for a human.
    PendingApproval,
    /// Cleared to execute.
    Approved,
    /// Handed to the executor; the outcome is not known yet.
    Executing,
    Rejected,
    Succeeded,
    Failed,
    /// Held too long, or pushed out by newer held decisions.
    Expired,
    /// The application was cancelled before it ran.
    Cancelled,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::PendingApproval => "pending_approval",
            DecisionStatus::Approved => "approved",
            DecisionStatus::Executing => "executing",
            DecisionStatus::Rejected => "rejected",
            DecisionStatus::Succeeded => "succeeded",
            DecisionStatus::Failed => "failed",
            DecisionStatus::Expired => "expired",
            DecisionStatus::Cancelled => "cancelled",
        }
    }

    /// Still waiting on a human or on the executor.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            DecisionStatus::PendingApproval | DecisionStatus::Approved | DecisionStatus::Executing
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }

    pub const TERMINAL: [DecisionStatus; 5] = [
        DecisionStatus::Rejected,
        DecisionStatus::Succeeded,
        DecisionStatus::Failed,
        DecisionStatus::Expired,
        DecisionStatus::Cancelled,
    ];
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionStatus {
    type Err = LeadPulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_approval" => Ok(DecisionStatus::PendingApproval),
            "approved" => Ok(DecisionStatus::Approved),
            "executing" => Ok(DecisionStatus::Executing),
            "rejected" => Ok(DecisionStatus::Rejected),
            "succeeded" => Ok(DecisionStatus::Succeeded),
            "failed" => Ok(DecisionStatus::Failed),
            "expired" => Ok(DecisionStatus::Expired),
            "cancelled" => Ok(DecisionStatus::Cancelled),
            other => Err(LeadPulseError::Store(format!("unknown decision status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub decision_type: DecisionType,
    /// Rule that produced it.
    pub rule: String,
    pub fingerprint: String,
    pub reasoning: String,
    pub action: serde_json::Value,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub status: DecisionStatus,
    /// Task id while the decision is being applied through the queue.
    pub execution_ref: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Decision {
    pub(crate) fn to_record(&self) -> DecisionRecord {
        DecisionRecord {
            id: self.id.clone(),
            decision_type: self.decision_type.as_str().to_string(),
            rule: self.rule.clone(),
            fingerprint: self.fingerprint.clone(),
            reasoning: self.reasoning.clone(),
            action: self.action.clone(),
            confidence: self.confidence,
            status: self.status.as_str().to_string(),
            execution_ref: self.execution_ref.clone(),
            error: self.error.clone(),
            created_at: self.timestamp,
            updated_at: self.updated_at,
        }
    }
}

impl TryFrom<DecisionRecord> for Decision {
    type Error = LeadPulseError;

    fn try_from(r: DecisionRecord) -> Result<Self, Self::Error> {
        Ok(Decision {
            decision_type: r.decision_type.parse()?,
            status: r.status.parse()?,
            id: r.id,
            rule: r.rule,
            fingerprint: r.fingerprint,
            reasoning: r.reasoning,
            action: r.action,
            confidence: r.confidence,
            timestamp: r.created_at,
            execution_ref: r.execution_ref,
            error: r.error,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    /// Confidence change for this outcome.
    pub fn adjustment(&self) -> f64 {
        match self {
            Outcome::Success => 0.05,
            Outcome::Failure => -0.10,
        }
    }

    pub fn status(&self) -> DecisionStatus {
        match self {
            Outcome::Success => DecisionStatus::Succeeded,
            Outcome::Failure => DecisionStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_reasoning_and_key_order() {
        let a = Proposal::new(
            DecisionType::PauseCampaign,
            0.7,
            "low conversions",
            serde_json::json!({"campaign_id": "spring", "company_id": "acme"}),
        );
        let b = Proposal::new(
            DecisionType::PauseCampaign,
            0.6,
            "still low",
            serde_json::json!({"company_id": "acme", "campaign_id": "spring"}),
        );
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = Proposal::new(DecisionType::ScaleResources, 0.7, "x", a.action.clone());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_status_strings_parse_back() {
        for status in DecisionStatus::TERMINAL {
            assert_eq!(status.as_str().parse::<DecisionStatus>().unwrap(), status);
            assert!(status.is_terminal());
        }
        assert!(DecisionStatus::Executing.is_open());
        assert!("paused".parse::<DecisionStatus>().is_err());
        assert_eq!("assign_agent".parse::<DecisionType>().unwrap(), DecisionType::AssignAgent);
    }
}
