//! Drip-campaign participants and the contacts they point at.

use chrono::{DateTime, Utc};
use leadpulse_core::error::LeadPulseError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrollmentStatus {
    type Err = LeadPulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EnrollmentStatus::Active),
            "completed" => Ok(EnrollmentStatus::Completed),
            "cancelled" => Ok(EnrollmentStatus::Cancelled),
            other => Err(LeadPulseError::Store(format!(
                "unknown enrollment status '{other}'"
            ))),
        }
    }
}

/// A contact's progress through one drip campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,
    pub contact_id: String,
    pub campaign_name: String,
    /// 0 = not started, N = step N has been sent.
    pub current_step: u32,
    pub status: EnrollmentStatus,
    pub enrolled_at: DateTime<Utc>,
    /// Any response from the contact stops further automatic steps.
    pub responded_at: Option<DateTime<Utc>>,
    /// Send time per step, keyed by 1-based step number.
    pub step_sent_at: BTreeMap<u32, DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn sent_at(&self, step: u32) -> Option<DateTime<Utc>> {
        self.step_sent_at.get(&step).copied()
    }

    pub fn next_step(&self) -> u32 {
        self.current_step + 1
    }

    pub fn is_active(&self) -> bool {
        self.status == EnrollmentStatus::Active
    }
}

/// CRM contact, the recipient of drip steps and owner of a lead score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub owner_id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub lead_score: i64,
    pub created_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(owner_id: &str, email: &str, first_name: Option<&str>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            email: email.to_string(),
            first_name: first_name.map(str::to_string),
            lead_score: 0,
            created_at: Utc::now(),
        }
    }
}
