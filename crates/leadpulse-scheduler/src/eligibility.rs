//! Eligibility: pure "is it due?" predicates.
//!
//! No I/O and no clock reads: callers pass `now`, so every rule here can be
//! exercised against a synthetic timeline.

use chrono::{DateTime, Duration, Utc};

use crate::drip::DripCampaign;
use crate::enrollment::{Enrollment, EnrollmentStatus};
use crate::tasks::{ScheduledTask, TaskStatus};

/// A task is due when it is `pending` and its target time has passed.
pub fn is_task_due(task: &ScheduledTask, now: DateTime<Utc>) -> bool {
    task.status == TaskStatus::Pending && task.scheduled_for <= now
}

/// Whether `step` (1-based) may be sent to this enrollment at `now`.
///
/// Requires an active, unresponded enrollment sitting exactly on `step - 1`.
/// Step 1 is due immediately; later steps wait `delay_days` after the
/// previous step's send time.
pub fn is_step_due(
    enrollment: &Enrollment,
    campaign: &DripCampaign,
    step: u32,
    now: DateTime<Utc>,
) -> bool {
    if enrollment.status != EnrollmentStatus::Active || enrollment.responded_at.is_some() {
        return false;
    }
    if step == 0 || enrollment.current_step != step - 1 {
        return false;
    }
    match step_due_at(enrollment, campaign, step) {
        Some(due_at) => now >= due_at,
        None => false,
    }
}

/// Earliest time `step` becomes sendable, ignoring status and responses.
/// `None` when the step does not exist or its predecessor was never sent.
pub fn step_due_at(
    enrollment: &Enrollment,
    campaign: &DripCampaign,
    step: u32,
) -> Option<DateTime<Utc>> {
    let config = campaign.step(step)?;
    if step == 1 {
        return Some(enrollment.enrolled_at);
    }
    let previous = enrollment.sent_at(step - 1)?;
    Some(previous + Duration::days(i64::from(config.delay_days)))
}

/// The next step to send right now, if any.
pub fn next_due_step(
    enrollment: &Enrollment,
    campaign: &DripCampaign,
    now: DateTime<Utc>,
) -> Option<u32> {
    let step = enrollment.next_step();
    is_step_due(enrollment, campaign, step, now).then_some(step)
}
