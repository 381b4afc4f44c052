//! Public operations: enqueue work, enroll contacts, cancel.
//!
//! Everything here only enqueues or flips flags; tasks and enrollments are
//! advanced exclusively by the dispatcher.

use chrono::{DateTime, Utc};
use leadpulse_core::clock::Clock;
use leadpulse_core::error::{LeadPulseError, Result};
use serde::Serialize;
use std::sync::Arc;

use crate::drip::{CampaignCatalog, drip_dedupe_prefix};
use crate::enrollment::{Contact, Enrollment};
use crate::persistence::SchedulerDb;
use crate::tasks::{CancelOutcome, NewTask, ScheduledTask, TaskType};

/// Result of [`SchedulerService::record_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOutcome {
    Recorded,
    /// A response was already on file, received at this time.
    AlreadyResponded(DateTime<Utc>),
}

pub struct SchedulerService {
    db: Arc<SchedulerDb>,
    catalog: Arc<CampaignCatalog>,
    clock: Arc<dyn Clock>,
    default_max_retries: u32,
}

impl SchedulerService {
    pub fn new(db: Arc<SchedulerDb>, catalog: Arc<CampaignCatalog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            catalog,
            clock,
            default_max_retries: 3,
        }
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Queue a unit of work. Returns the task id.
    pub fn schedule_task(
        &self,
        owner_id: &str,
        task_type: TaskType,
        payload: serde_json::Value,
        scheduled_for: DateTime<Utc>,
        max_retries: Option<u32>,
    ) -> Result<String> {
        let task = self.new_task(owner_id, task_type, payload, scheduled_for, max_retries)?;
        let task = self
            .db
            .insert_task(&task, self.clock.now())?
            .ok_or_else(|| LeadPulseError::Store("task insert was ignored".into()))?;
        tracing::info!(
            "📅 Task scheduled: {} ({}) for {}",
            task.id,
            task.task_type,
            task.scheduled_for
        );
        Ok(task.id)
    }

    /// Like [`Self::schedule_task`], but at most one task ever exists per
    /// `dedupe_key`. A repeat call returns the id of the task already holding
    /// the key, whatever its status.
    pub fn schedule_unique_task(
        &self,
        owner_id: &str,
        task_type: TaskType,
        payload: serde_json::Value,
        scheduled_for: DateTime<Utc>,
        dedupe_key: &str,
    ) -> Result<String> {
        let task = self
            .new_task(owner_id, task_type, payload, scheduled_for, None)?
            .with_dedupe_key(dedupe_key);
        if let Some(task) = self.db.insert_task(&task, self.clock.now())? {
            tracing::info!("📅 Task scheduled: {} ({}) key={}", task.id, task.task_type, dedupe_key);
            return Ok(task.id);
        }
        let existing = self
            .db
            .task_by_dedupe_key(dedupe_key)?
            .ok_or_else(|| LeadPulseError::Store(format!("no task holds key {dedupe_key}")))?;
        tracing::debug!("♻️ Task {} already holds key {}", existing.id, dedupe_key);
        Ok(existing.id)
    }

    fn new_task(
        &self,
        owner_id: &str,
        task_type: TaskType,
        payload: serde_json::Value,
        scheduled_for: DateTime<Utc>,
        max_retries: Option<u32>,
    ) -> Result<NewTask> {
        if task_type == TaskType::AdvanceDripStep {
            return Err(LeadPulseError::Validation(
                "advance-drip-step tasks are created by the dispatcher".into(),
            ));
        }
        if owner_id.trim().is_empty() {
            return Err(LeadPulseError::Validation("owner id must not be empty".into()));
        }
        if !payload.is_object() {
            return Err(LeadPulseError::Validation("payload must be a JSON object".into()));
        }
        Ok(NewTask::new(owner_id, task_type, payload, scheduled_for)
            .with_max_retries(max_retries.unwrap_or(self.default_max_retries))
            .created_by("api"))
    }

    pub fn add_contact(&self, owner_id: &str, email: &str, first_name: Option<&str>) -> Result<Contact> {
        if !email.contains('@') {
            return Err(LeadPulseError::Validation(format!("invalid email '{email}'")));
        }
        let mut contact = Contact::new(owner_id, email, first_name);
        contact.created_at = self.clock.now();
        self.db.upsert_contact(&contact)?;
        tracing::info!("👤 Contact added: {} <{}>", contact.id, contact.email);
        Ok(contact)
    }

    /// Start a contact on a campaign (`current_step = 0`, `active`).
    pub fn enroll(&self, contact_id: &str, campaign_name: &str) -> Result<String> {
        if self.catalog.get(campaign_name).is_none() {
            return Err(LeadPulseError::NotFound(format!("campaign '{campaign_name}'")));
        }
        if self.db.get_contact(contact_id)?.is_none() {
            return Err(LeadPulseError::NotFound(format!("contact {contact_id}")));
        }
        if self.db.has_active_enrollment(contact_id, campaign_name)? {
            return Err(LeadPulseError::InvalidState(format!(
                "contact {contact_id} is already active in '{campaign_name}'"
            )));
        }
        let enrollment = self
            .db
            .insert_enrollment(contact_id, campaign_name, self.clock.now())?;
        tracing::info!(
            "💧 Enrolled contact {} in '{}' ({})",
            contact_id,
            campaign_name,
            enrollment.id
        );
        Ok(enrollment.id)
    }

    /// Mark that the contact answered. Later steps are suppressed.
    /// The first response wins; later calls keep its timestamp.
    pub fn record_response(&self, enrollment_id: &str) -> Result<ResponseOutcome> {
        self.require_enrollment(enrollment_id)?;
        if self.db.record_response(enrollment_id, self.clock.now())? {
            tracing::info!("💬 Response recorded for enrollment {enrollment_id}");
            return Ok(ResponseOutcome::Recorded);
        }
        let at = self.require_enrollment(enrollment_id)?.responded_at;
        Ok(ResponseOutcome::AlreadyResponded(at.unwrap_or_default()))
    }

    pub fn cancel_task(&self, task_id: &str) -> Result<CancelOutcome> {
        let outcome = self.db.cancel_task(task_id, self.clock.now())?;
        tracing::info!("🚫 Cancel task {task_id}: {outcome:?}");
        Ok(outcome)
    }

    /// Cancel an active enrollment and its queued step tasks.
    /// Returns false if it was not active.
    pub fn cancel_enrollment(&self, enrollment_id: &str) -> Result<bool> {
        self.require_enrollment(enrollment_id)?;
        let now = self.clock.now();
        if !self.db.cancel_enrollment(enrollment_id, now)? {
            return Ok(false);
        }
        let dropped = self
            .db
            .cancel_pending_with_prefix(&drip_dedupe_prefix(enrollment_id), now)?;
        tracing::info!("🚫 Enrollment {enrollment_id} cancelled ({dropped} queued steps dropped)");
        Ok(true)
    }

    pub fn task(&self, task_id: &str) -> Result<ScheduledTask> {
        self.db
            .get_task(task_id)?
            .ok_or_else(|| LeadPulseError::NotFound(format!("task {task_id}")))
    }

    pub fn enrollment(&self, enrollment_id: &str) -> Result<Enrollment> {
        self.require_enrollment(enrollment_id)
    }

    fn require_enrollment(&self, enrollment_id: &str) -> Result<Enrollment> {
        self.db
            .get_enrollment(enrollment_id)?
            .ok_or_else(|| LeadPulseError::NotFound(format!("enrollment {enrollment_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drip::{DripCampaign, DripStep};
    use crate::enrollment::EnrollmentStatus;
    use crate::tasks::TaskStatus;
    use leadpulse_core::clock::FakeClock;

    fn service() -> (SchedulerService, Arc<SchedulerDb>) {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let mut catalog = CampaignCatalog::default();
        catalog.insert(DripCampaign {
            name: "welcome".into(),
            steps: vec![DripStep {
                delay_days: 0,
                subject: "Hi".into(),
                body: "Hello".into(),
            }],
        });
        let svc = SchedulerService::new(db.clone(), Arc::new(catalog), Arc::new(FakeClock::default()));
        (svc, db)
    }

    #[test]
    fn test_schedule_task_defaults() {
        let (svc, _) = service();
        let id = svc
            .schedule_task(
                "acme",
                TaskType::SendEmail,
                serde_json::json!({"to": "a@b.c", "subject": "s", "body": "b"}),
                Utc::now(),
                None,
            )
            .unwrap();
        let task = svc.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.created_by, "api");
    }

    #[test]
    fn test_schedule_task_rejects_internal_type() {
        let (svc, _) = service();
        let err = svc
            .schedule_task("acme", TaskType::AdvanceDripStep, serde_json::json!({}), Utc::now(), None)
            .unwrap_err();
        assert!(matches!(err, LeadPulseError::Validation(_)));
        let err = svc
            .schedule_task("acme", TaskType::Custom, serde_json::json!("x"), Utc::now(), Some(0))
            .unwrap_err();
        assert!(matches!(err, LeadPulseError::Validation(_)));
    }

    #[test]
    fn test_schedule_unique_task_returns_existing_id() {
        let (svc, db) = service();
        let payload = serde_json::json!({"action": "apply_decision", "decision_id": "d1"});
        let first = svc
            .schedule_unique_task("autopilot", TaskType::Custom, payload.clone(), Utc::now(), "decision:d1")
            .unwrap();
        let again = svc
            .schedule_unique_task("autopilot", TaskType::Custom, payload.clone(), Utc::now(), "decision:d1")
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(db.status_counts().unwrap().pending, 1);

        let other = svc
            .schedule_unique_task("autopilot", TaskType::Custom, payload, Utc::now(), "decision:d2")
            .unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn test_enroll_validations() {
        let (svc, _) = service();
        let contact = svc.add_contact("acme", "ana@example.com", Some("Ana")).unwrap();
        assert!(matches!(
            svc.enroll(&contact.id, "unknown"),
            Err(LeadPulseError::NotFound(_))
        ));
        assert!(matches!(svc.enroll("ghost", "welcome"), Err(LeadPulseError::NotFound(_))));

        let id = svc.enroll(&contact.id, "welcome").unwrap();
        let e = svc.enrollment(&id).unwrap();
        assert_eq!(e.current_step, 0);
        assert_eq!(e.status, EnrollmentStatus::Active);
        assert!(matches!(
            svc.enroll(&contact.id, "welcome"),
            Err(LeadPulseError::InvalidState(_))
        ));
        assert!(svc.add_contact("acme", "not-an-email", None).is_err());
    }

    #[test]
    fn test_cancel_enrollment_drops_queued_steps() {
        let (svc, db) = service();
        let contact = svc.add_contact("acme", "ana@example.com", None).unwrap();
        let id = svc.enroll(&contact.id, "welcome").unwrap();
        let queued = NewTask::new(
            "acme",
            TaskType::AdvanceDripStep,
            serde_json::json!({"enrollment_id": id, "step": 1}),
            Utc::now(),
        )
        .with_dedupe_key(crate::drip::drip_dedupe_key(&id, 1));
        let task = db.insert_task(&queued, Utc::now()).unwrap().unwrap();

        assert!(svc.cancel_enrollment(&id).unwrap());
        assert!(!svc.cancel_enrollment(&id).unwrap());
        assert_eq!(svc.task(&task.id).unwrap().status, TaskStatus::Cancelled);
        assert!(matches!(svc.cancel_enrollment("ghost"), Err(LeadPulseError::NotFound(_))));
    }

    #[test]
    fn test_record_response_first_write_wins() {
        let (svc, _) = service();
        let contact = svc.add_contact("acme", "ana@example.com", None).unwrap();
        let id = svc.enroll(&contact.id, "welcome").unwrap();
        assert_eq!(svc.record_response(&id).unwrap(), ResponseOutcome::Recorded);
        let first = svc.enrollment(&id).unwrap().responded_at.unwrap();
        assert_eq!(
            svc.record_response(&id).unwrap(),
            ResponseOutcome::AlreadyResponded(first)
        );
        assert!(matches!(svc.record_response("ghost"), Err(LeadPulseError::NotFound(_))));
    }
}
