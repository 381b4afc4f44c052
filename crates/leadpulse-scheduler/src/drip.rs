//! Drip campaigns and the `advance-drip-step` handler.
//!
//! Advancing an enrollment is an ordinary task so it gets the same claim,
//! retry and idempotency handling as everything else. The handler sends the
//! step message, then records the step with a conditional update that only
//! succeeds if the enrollment is still active, unresponded and on `step - 1`.

use async_trait::async_trait;
use leadpulse_core::config::CampaignConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::delivery::{Delivery, DeliveryChannel, DeliveryProvider};
use crate::enrollment::{Contact, Enrollment};
use crate::handlers::{ActionHandler, HandlerError, HandlerOutput, TaskContext, required_str};
use crate::persistence::SchedulerDb;
use crate::tasks::TaskType;

/// One message in a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DripStep {
    /// Days after the previous step. Ignored for step 1.
    pub delay_days: u32,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DripCampaign {
    pub name: String,
    pub steps: Vec<DripStep>,
}

impl DripCampaign {
    /// 1-based step lookup.
    pub fn step(&self, step: u32) -> Option<&DripStep> {
        if step == 0 {
            return None;
        }
        self.steps.get(step as usize - 1)
    }

    pub fn total_steps(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn is_final(&self, step: u32) -> bool {
        step == self.total_steps()
    }
}

impl From<&CampaignConfig> for DripCampaign {
    fn from(config: &CampaignConfig) -> Self {
        Self {
            name: config.name.clone(),
            steps: config
                .steps
                .iter()
                .map(|s| DripStep {
                    delay_days: s.delay_days,
                    subject: s.subject.clone(),
                    body: s.body.clone(),
                })
                .collect(),
        }
    }
}

/// Campaign definitions by name.
#[derive(Debug, Clone, Default)]
pub struct CampaignCatalog {
    campaigns: HashMap<String, DripCampaign>,
}

impl CampaignCatalog {
    pub fn from_config(campaigns: &[CampaignConfig]) -> Self {
        let mut catalog = Self::default();
        for c in campaigns {
            catalog.insert(DripCampaign::from(c));
        }
        catalog
    }

    pub fn insert(&mut self, campaign: DripCampaign) {
        self.campaigns.insert(campaign.name.clone(), campaign);
    }

    pub fn get(&self, name: &str) -> Option<&DripCampaign> {
        self.campaigns.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.campaigns.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Fill `{{first_name}}` and `{{email}}`. A missing first name becomes "there".
pub fn render(template: &str, contact: &Contact) -> String {
    template
        .replace("{{first_name}}", contact.first_name.as_deref().unwrap_or("there"))
        .replace("{{email}}", &contact.email)
}

/// Dedupe key for the advance task of `step`.
pub fn drip_dedupe_key(enrollment_id: &str, step: u32) -> String {
    format!("drip:{enrollment_id}:{step}")
}

/// Prefix shared by every advance task of one enrollment.
pub fn drip_dedupe_prefix(enrollment_id: &str) -> String {
    format!("drip:{enrollment_id}:")
}

/// Payload: `{"enrollment_id", "step"}`.
pub struct AdvanceDripStepHandler {
    db: Arc<SchedulerDb>,
    catalog: Arc<CampaignCatalog>,
    provider: Arc<dyn DeliveryProvider>,
}

impl AdvanceDripStepHandler {
    pub fn new(
        db: Arc<SchedulerDb>,
        catalog: Arc<CampaignCatalog>,
        provider: Arc<dyn DeliveryProvider>,
    ) -> Self {
        Self {
            db,
            catalog,
            provider,
        }
    }

    fn load(&self, enrollment_id: &str) -> Result<Enrollment, HandlerError> {
        self.db
            .get_enrollment(enrollment_id)
            .map_err(|e| HandlerError::Transient(e.to_string()))?
            .ok_or_else(|| HandlerError::Permanent(format!("enrollment {enrollment_id} not found")))
    }

    /// Work that no longer applies, or was already done, is a success.
    fn precheck(&self, enrollment: &Enrollment, step: u32) -> Result<Option<HandlerOutput>, HandlerError> {
        if enrollment.responded_at.is_some() {
            return Ok(Some(HandlerOutput::suppressed("contact responded")));
        }
        if enrollment.current_step >= step {
            return Ok(Some(HandlerOutput::with_data(serde_json::json!({
                "step": step,
                "already_sent": true,
            }))));
        }
        if !enrollment.is_active() {
            return Ok(Some(HandlerOutput::suppressed(format!(
                "enrollment {}",
                enrollment.status
            ))));
        }
        if enrollment.current_step != step - 1 {
            return Err(HandlerError::Permanent(format!(
                "enrollment {} is on step {}, cannot send step {step}",
                enrollment.id, enrollment.current_step
            )));
        }
        Ok(None)
    }
}

#[async_trait]
impl ActionHandler for AdvanceDripStepHandler {
    fn task_type(&self) -> TaskType {
        TaskType::AdvanceDripStep
    }

    async fn handle(&self, ctx: &TaskContext, payload: &Value) -> Result<HandlerOutput, HandlerError> {
        let enrollment_id = required_str(payload, "enrollment_id")?;
        let step = payload["step"]
            .as_u64()
            .filter(|s| *s >= 1)
            .ok_or_else(|| HandlerError::Configuration("missing positive 'step' in payload".into()))?;
        let step = u32::try_from(step)
            .map_err(|_| HandlerError::Configuration(format!("step {step} is out of range")))?;

        let enrollment = self.load(enrollment_id)?;
        if let Some(done) = self.precheck(&enrollment, step)? {
            tracing::info!("⏭️ Drip step {step} for {enrollment_id} skipped");
            return Ok(done);
        }

        let campaign = self.catalog.get(&enrollment.campaign_name).ok_or_else(|| {
            HandlerError::Configuration(format!("unknown campaign '{}'", enrollment.campaign_name))
        })?;
        let config = campaign.step(step).ok_or_else(|| {
            HandlerError::Configuration(format!(
                "campaign '{}' has no step {step}",
                campaign.name
            ))
        })?;
        let contact = self
            .db
            .get_contact(&enrollment.contact_id)
            .map_err(|e| HandlerError::Transient(e.to_string()))?
            .ok_or_else(|| {
                HandlerError::Permanent(format!("contact {} not found", enrollment.contact_id))
            })?;

        let delivery = Delivery {
            idempotency_key: ctx.idempotency_key().to_string(),
            channel: DeliveryChannel::Email,
            recipient: contact.email.clone(),
            subject: Some(render(&config.subject, &contact)),
            body: render(&config.body, &contact),
            metadata: serde_json::json!({
                "owner_id": ctx.owner_id,
                "enrollment_id": enrollment_id,
                "campaign": campaign.name,
                "step": step,
            }),
        };
        let receipt = self.provider.deliver(&delivery).await?;

        let is_final = campaign.is_final(step);
        let recorded = self
            .db
            .record_step_sent(enrollment_id, step, ctx.now, is_final)
            .map_err(|e| HandlerError::Transient(e.to_string()))?;

        if !recorded {
            // enrollment changed while the message was in flight
            let current = self.load(enrollment_id)?;
            return match self.precheck(&current, step)? {
                Some(done) => Ok(done),
                None => Err(HandlerError::Transient(format!(
                    "step {step} for {enrollment_id} was not recorded"
                ))),
            };
        }

        tracing::info!(
            "💧 Drip '{}' step {step}/{} sent to {}{}",
            campaign.name,
            campaign.total_steps(),
            contact.email,
            if is_final { " (campaign complete)" } else { "" }
        );
        Ok(HandlerOutput::with_data(serde_json::json!({
            "step": step,
            "completed": is_final,
            "dry_run": receipt.dry_run,
        })))
    }
}
