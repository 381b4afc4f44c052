//! Read-only views over the stores for operators and the `stats` command.

use chrono::{DateTime, Duration, Utc};
use leadpulse_core::clock::Clock;
use leadpulse_core::error::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::drip::CampaignCatalog;
use crate::eligibility::step_due_at;
use crate::enrollment::EnrollmentStatus;
use crate::persistence::{SchedulerDb, StatusCounts};
use crate::retry::RETRIES_EXHAUSTED;
use crate::tasks::ScheduledTask;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DueSoon {
    /// Pending and already due.
    pub overdue: usize,
    /// Pending and due within the window.
    pub upcoming: usize,
}

/// Enrollment count per campaign and `current_step`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepBucket {
    pub active: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub responded: usize,
}

/// An enrollment whose next step should have gone out already.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StuckEnrollment {
    pub enrollment_id: String,
    pub campaign_name: String,
    pub step: u32,
    pub due_at: DateTime<Utc>,
    pub overdue_secs: i64,
}

pub struct Inspector {
    db: Arc<SchedulerDb>,
    catalog: Arc<CampaignCatalog>,
    clock: Arc<dyn Clock>,
}

impl Inspector {
    pub fn new(db: Arc<SchedulerDb>, catalog: Arc<CampaignCatalog>, clock: Arc<dyn Clock>) -> Self {
        Self { db, catalog, clock }
    }

    pub fn due_soon(&self, window: Duration) -> Result<DueSoon> {
        let now = self.clock.now();
        Ok(DueSoon {
            overdue: self.db.count_pending_between(DateTime::<Utc>::MIN_UTC, now)?,
            upcoming: self
                .db
                .count_pending_between(now + Duration::milliseconds(1), now + window)?,
        })
    }

    /// Failed tasks whose retry budget ran out.
    pub fn retry_exhausted(&self, limit: usize) -> Result<Vec<ScheduledTask>> {
        self.db.failed_tasks_with_error(RETRIES_EXHAUSTED, limit)
    }

    /// Most recent failures of any kind, with their last error.
    pub fn failed_tasks(&self, limit: usize) -> Result<Vec<ScheduledTask>> {
        self.db.failed_tasks(limit)
    }

    pub fn status_counts(&self) -> Result<StatusCounts> {
        self.db.status_counts()
    }

    /// campaign → current step → counts.
    pub fn step_distribution(&self) -> Result<BTreeMap<String, BTreeMap<u32, StepBucket>>> {
        let mut dist: BTreeMap<String, BTreeMap<u32, StepBucket>> = BTreeMap::new();
        for e in self.db.enrollments(None)? {
            let bucket = dist
                .entry(e.campaign_name.clone())
                .or_default()
                .entry(e.current_step)
                .or_default();
            match e.status {
                EnrollmentStatus::Active => bucket.active += 1,
                EnrollmentStatus::Completed => bucket.completed += 1,
                EnrollmentStatus::Cancelled => bucket.cancelled += 1,
            }
            if e.responded_at.is_some() {
                bucket.responded += 1;
            }
        }
        Ok(dist)
    }

    /// Active, unresponded enrollments whose next step is overdue by more
    /// than `grace`.
    pub fn stuck_enrollments(&self, grace: Duration) -> Result<Vec<StuckEnrollment>> {
        let now = self.clock.now();
        let mut stuck = Vec::new();
        for e in self.db.enrollments(Some(EnrollmentStatus::Active))? {
            if e.responded_at.is_some() {
                continue;
            }
            let Some(campaign) = self.catalog.get(&e.campaign_name) else {
                continue;
            };
            let step = e.next_step();
            let Some(due_at) = step_due_at(&e, campaign, step) else {
                continue;
            };
            if now - due_at > grace {
                stuck.push(StuckEnrollment {
                    enrollment_id: e.id.clone(),
                    campaign_name: e.campaign_name.clone(),
                    step,
                    due_at,
                    overdue_secs: (now - due_at).num_seconds(),
                });
            }
        }
        Ok(stuck)
    }
}
