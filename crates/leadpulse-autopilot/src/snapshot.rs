//! Aggregate state read by the rule pass.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadpulse_core::error::{LeadPulseError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

/// A marketing campaign and its running metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub company_id: String,
    pub name: String,
    pub status: CampaignStatus,
    #[serde(default)]
    pub target_conversions: u32,
    #[serde(default)]
    pub conversions: u32,
    /// Messages sent so far.
    #[serde(default)]
    pub sent: u32,
    #[serde(default)]
    pub replies: u32,
    #[serde(default)]
    pub assigned_agent_id: Option<String>,
}

impl Campaign {
    pub fn is_active(&self) -> bool {
        self.status == CampaignStatus::Active
    }

    /// Replies per message sent; `None` before anything was sent.
    pub fn reply_rate(&self) -> Option<f64> {
        (self.sent > 0).then(|| f64::from(self.replies) / f64::from(self.sent))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub status: AgentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub companies: Vec<Company>,
    #[serde(default)]
    pub campaigns: Vec<Campaign>,
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default = "Utc::now")]
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            companies: Vec::new(),
            campaigns: Vec::new(),
            agents: Vec::new(),
            taken_at: Utc::now(),
        }
    }

    pub fn active_campaigns(&self) -> impl Iterator<Item = &Campaign> {
        self.campaigns.iter().filter(|c| c.is_active())
    }

    pub fn campaigns_of<'a>(&'a self, company_id: &'a str) -> impl Iterator<Item = &'a Campaign> {
        self.campaigns.iter().filter(move |c| c.company_id == company_id)
    }

    pub fn idle_agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.iter().filter(|a| a.status == AgentStatus::Idle)
    }
}

/// Where the autopilot gets its view of the world.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Result<Snapshot>;
}

/// Reads a JSON snapshot file exported by the CRM.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotSource for JsonFileSource {
    async fn snapshot(&self) -> Result<Snapshot> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            LeadPulseError::Config(format!("Failed to read snapshot {}: {e}", self.path.display()))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Fixed snapshot.
pub struct StaticSource(pub Snapshot);

#[async_trait]
impl SnapshotSource for StaticSource {
    async fn snapshot(&self) -> Result<Snapshot> {
        Ok(self.0.clone())
    }
}
