//! LeadPulse configuration system.
//!
//! Loaded from `~/.leadpulse/config.toml`. Every field has a default so an
//! empty file (or no file) yields a runnable dry-run setup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{LeadPulseError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LeadPulseConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub autopilot: AutopilotConfig,
    #[serde(default)]
    pub campaigns: Vec<CampaignConfig>,
}

impl LeadPulseConfig {
    /// Load config from the default path (~/.leadpulse/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LeadPulseError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| LeadPulseError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| LeadPulseError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// The LeadPulse home directory (~/.leadpulse).
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".leadpulse")
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.tick_secs == 0 {
            return Err(LeadPulseError::Config("scheduler.tick_secs must be > 0".into()));
        }
        if self.scheduler.batch_size == 0 || self.scheduler.max_concurrency == 0 {
            return Err(LeadPulseError::Config(
                "scheduler.batch_size and scheduler.max_concurrency must be > 0".into(),
            ));
        }
        if self.retry.base_delay_secs == 0 || self.retry.base_delay_secs > self.retry.max_delay_secs {
            return Err(LeadPulseError::Config(
                "retry.base_delay_secs must be > 0 and <= retry.max_delay_secs".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.autopilot.auto_execute_threshold) {
            return Err(LeadPulseError::Config(
                "autopilot.auto_execute_threshold must be within 0.0..=1.0".into(),
            ));
        }
        if self.autopilot.max_pending == 0 || self.autopilot.approval_ttl_secs == 0 {
            return Err(LeadPulseError::Config(
                "autopilot.max_pending and autopilot.approval_ttl_secs must be > 0".into(),
            ));
        }
        if !self.delivery.dry_run && self.delivery.email_endpoint.is_none() {
            return Err(LeadPulseError::Config(
                "delivery.email_endpoint is required when delivery.dry_run = false".into(),
            ));
        }

        let mut seen = HashSet::new();
        for campaign in &self.campaigns {
            if campaign.name.trim().is_empty() {
                return Err(LeadPulseError::Config("campaign name must not be empty".into()));
            }
            if !seen.insert(campaign.name.as_str()) {
                return Err(LeadPulseError::Config(format!(
                    "duplicate campaign '{}'",
                    campaign.name
                )));
            }
            if campaign.steps.is_empty() {
                return Err(LeadPulseError::Config(format!(
                    "campaign '{}' has no steps",
                    campaign.name
                )));
            }
        }
        Ok(())
    }

    /// Database path with `~` expanded.
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.scheduler.db_path).to_string())
    }
}

/// Dispatcher loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Polling interval.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Max due tasks selected per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Max handlers running at once within a tick.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// A `processing` claim older than this is considered abandoned.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
    /// How long the active-dispatcher lease lasts without renewal.
    #[serde(default = "default_leader_lease_secs")]
    pub leader_lease_secs: u64,
    /// Lease holder name; defaults to a random id per process.
    #[serde(default)]
    pub instance_id: Option<String>,
}

fn default_db_path() -> String {
    "~/.leadpulse/scheduler.db".into()
}
fn default_tick_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    50
}
fn default_max_concurrency() -> usize {
    8
}
fn default_claim_lease_secs() -> u64 {
    900
}
fn default_leader_lease_secs() -> u64 {
    180
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            tick_secs: default_tick_secs(),
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            claim_lease_secs: default_claim_lease_secs(),
            leader_lease_secs: default_leader_lease_secs(),
            instance_id: None,
        }
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

fn default_base_delay_secs() -> u64 {
    60
}
fn default_max_delay_secs() -> u64 {
    3600
}
fn default_max_retries() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            default_max_retries: default_max_retries(),
        }
    }
}

/// Outbound delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Log deliveries instead of calling providers.
    #[serde(default = "bool_true")]
    pub dry_run: bool,
    /// HTTP endpoint of the email relay.
    #[serde(default)]
    pub email_endpoint: Option<String>,
    /// HTTP endpoint for operator notifications (falls back to email relay).
    #[serde(default)]
    pub notification_endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_from_address")]
    pub from_address: String,
}

fn bool_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_from_address() -> String {
    "outreach@leadpulse.local".into()
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            email_endpoint: None,
            notification_endpoint: None,
            api_key: None,
            timeout_secs: default_timeout_secs(),
            from_address: default_from_address(),
        }
    }
}

/// Decision Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_autopilot_interval")]
    pub interval_secs: u64,
    /// Decisions at or above this confidence run without human approval.
    #[serde(default = "default_auto_execute_threshold")]
    pub auto_execute_threshold: f64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// JSON snapshot consumed by the rule pass.
    #[serde(default)]
    pub snapshot_path: Option<String>,
    /// Recipient of applied decisions.
    #[serde(default = "default_operator")]
    pub operator: String,
    /// Held decisions nobody acted on expire after this long.
    #[serde(default = "default_approval_ttl")]
    pub approval_ttl_secs: u64,
    /// Most decisions held for approval at once; older ones expire first.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// A finished decision is not proposed again until this long after it closed.
    #[serde(default = "default_repeat_after")]
    pub repeat_after_secs: u64,
}

fn default_autopilot_interval() -> u64 {
    900
}
fn default_auto_execute_threshold() -> f64 {
    0.8
}
fn default_history_limit() -> usize {
    500
}
fn default_operator() -> String {
    "ops@leadpulse.local".into()
}
fn default_approval_ttl() -> u64 {
    7 * 24 * 3600
}
fn default_max_pending() -> usize {
    100
}
fn default_repeat_after() -> u64 {
    24 * 3600
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_autopilot_interval(),
            auto_execute_threshold: default_auto_execute_threshold(),
            history_limit: default_history_limit(),
            snapshot_path: None,
            operator: default_operator(),
            approval_ttl_secs: default_approval_ttl(),
            max_pending: default_max_pending(),
            repeat_after_secs: default_repeat_after(),
        }
    }
}

/// A drip campaign definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub name: String,
    pub steps: Vec<StepConfig>,
}

/// One outreach step. `delay_days` counts from the previous step's send time
/// and is ignored for the first step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub delay_days: u32,
    pub subject: String,
    pub body: String,
}
