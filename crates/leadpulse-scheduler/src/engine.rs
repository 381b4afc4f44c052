//! Dispatcher: the tick that selects, claims and runs due work.
//!
//! One tick:
//! 1. put abandoned `processing` claims back through the retry controller
//! 2. enqueue an `advance-drip-step` task for every enrollment whose next
//!    step is due (deduplicated per enrollment and step)
//! 3. select due tasks, oldest first, and claim them one by one
//! 4. run the claimed handlers concurrently (bounded)
//! 5. persist each outcome as decided by [`crate::retry::decide`]
//!
//! Handler failures never escape a tick; a panicking handler counts as a
//! transient failure. Store failures while claiming stop
//! the remaining claims; the next tick picks the work up again.

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use leadpulse_core::clock::Clock;
use leadpulse_core::config::LeadPulseConfig;
use leadpulse_core::error::Result;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::drip::{CampaignCatalog, drip_dedupe_key};
use crate::eligibility::{next_due_step, step_due_at};
use crate::enrollment::EnrollmentStatus;
use crate::handlers::{HandlerError, HandlerOutput, HandlerRegistry, TaskContext};
use crate::persistence::SchedulerDb;
use crate::retry::{RetryPolicy, Transition, decide};
use crate::tasks::{NewTask, ScheduledTask, TaskStatus, TaskType};

/// Name of the lease row guarding the dispatcher.
pub const DISPATCHER_LEASE: &str = "dispatcher";

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Stale claims returned to the retry controller.
    pub recovered: usize,
    /// New drip advance tasks.
    pub enqueued: usize,
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Claims stopped early because the store failed.
    pub claim_aborted: bool,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }

    fn count(&mut self, transition: &Transition) {
        match transition {
            Transition::Complete { .. } => self.completed += 1,
            Transition::Retry { .. } => self.retried += 1,
            Transition::Fail { .. } => self.failed += 1,
            Transition::Cancel { .. } => self.cancelled += 1,
        }
    }
}

/// Lease settings for single-active-dispatcher mode.
#[derive(Debug, Clone)]
pub struct LeaderLease {
    pub holder: String,
    pub ttl: chrono::Duration,
}

pub struct Dispatcher {
    db: Arc<SchedulerDb>,
    handlers: HandlerRegistry,
    catalog: Arc<CampaignCatalog>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    max_concurrency: usize,
    claim_lease: chrono::Duration,
    leader: Option<LeaderLease>,
}

impl Dispatcher {
    pub fn new(
        db: Arc<SchedulerDb>,
        handlers: HandlerRegistry,
        catalog: Arc<CampaignCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            handlers,
            catalog,
            retry: RetryPolicy::default(),
            clock,
            batch_size: 50,
            max_concurrency: 8,
            claim_lease: chrono::Duration::minutes(15),
            leader: None,
        }
    }

    /// Apply `[scheduler]` and `[retry]` settings.
    pub fn configured(mut self, config: &LeadPulseConfig) -> Self {
        self.retry = RetryPolicy::from_config(&config.retry);
        self.batch_size = config.scheduler.batch_size;
        self.max_concurrency = config.scheduler.max_concurrency;
        self.claim_lease = chrono::Duration::seconds(config.scheduler.claim_lease_secs as i64);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_limits(mut self, batch_size: usize, max_concurrency: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_claim_lease(mut self, lease: chrono::Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn with_leader_lease(mut self, holder: impl Into<String>, ttl: chrono::Duration) -> Self {
        self.leader = Some(LeaderLease {
            holder: holder.into(),
            ttl,
        });
        self
    }

    pub fn db(&self) -> &Arc<SchedulerDb> {
        &self.db
    }

    /// Tick only if this instance holds (or can take) the leader lease.
    /// Returns `None` when another instance is active.
    pub async fn tick_if_leader(&self) -> Result<Option<TickReport>> {
        if let Some(lease) = &self.leader {
            let now = self.clock.now();
            if !self
                .db
                .acquire_lease(DISPATCHER_LEASE, &lease.holder, now, lease.ttl)?
            {
                tracing::debug!("⏸️ Dispatcher lease held elsewhere; skipping tick");
                return Ok(None);
            }
        }
        self.tick().await.map(Some)
    }

    /// Give up the leader lease, if configured.
    pub fn release_lease(&self) -> Result<()> {
        match &self.leader {
            Some(lease) => self.db.release_lease(DISPATCHER_LEASE, &lease.holder),
            None => Ok(()),
        }
    }

    /// Run one dispatcher cycle.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();
        let now = self.clock.now();

        let recovered = self.recover_stale_claims(now, &mut report)?;
        report.recovered = recovered;
        report.enqueued = self.enqueue_due_steps(now)?;

        let due = self.db.due_tasks(now, self.batch_size)?;
        let mut claimed = Vec::with_capacity(due.len());
        for task in due {
            match self.db.claim_task(&task.id, now) {
                Ok(true) => claimed.push(task),
                Ok(false) => tracing::debug!("Task {} claimed elsewhere", task.id),
                Err(e) => {
                    tracing::warn!("⚠️ Claim failed, stopping this tick's claims: {e}");
                    report.claim_aborted = true;
                    break;
                }
            }
        }
        report.claimed = claimed.len();

        let results: Vec<(ScheduledTask, std::result::Result<HandlerOutput, HandlerError>)> =
            futures::stream::iter(claimed.into_iter().map(|task| self.execute(task)))
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;

        for (task, result) in results {
            // a cancel may have landed while the handler ran
            let latest = match self.db.get_task(&task.id) {
                Ok(Some(t)) => t,
                _ => task,
            };
            let transition = decide(&latest, &result, &self.retry, self.clock.now());
            if self.persist(&latest, &transition) {
                report.count(&transition);
            }
        }

        if !report.is_idle() {
            tracing::debug!("Tick: {:?}", report);
        }
        Ok(report)
    }

    async fn execute(
        &self,
        task: ScheduledTask,
    ) -> (ScheduledTask, std::result::Result<HandlerOutput, HandlerError>) {
        let ctx = TaskContext {
            task_id: task.id.clone(),
            owner_id: task.owner_id.clone(),
            attempt: task.retry_count + 1,
            now: self.clock.now(),
        };
        let result = match self.handlers.get(task.task_type) {
            Some(handler) => match AssertUnwindSafe(handler.handle(&ctx, &task.payload))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    tracing::error!("💥 Handler for task {} panicked: {msg}", task.id);
                    Err(HandlerError::Transient(format!("handler panicked: {msg}")))
                }
            },
            None => Err(HandlerError::Configuration(format!(
                "no handler registered for '{}'",
                task.task_type
            ))),
        };
        (task, result)
    }

    /// Write a transition. Returns false if the row was no longer ours.
    fn persist(&self, task: &ScheduledTask, transition: &Transition) -> bool {
        let now = self.clock.now();
        let written = match transition {
            Transition::Complete {
                executed_at,
                output,
            } => self
                .db
                .complete_task(&task.id, *executed_at, output.as_ref()),
            Transition::Retry {
                retry_count,
                scheduled_for,
                error,
            } => self
                .db
                .retry_task(&task.id, *retry_count, *scheduled_for, error, now),
            Transition::Fail { error } => {
                self.db.finish_task(&task.id, TaskStatus::Failed, error, now)
            }
            Transition::Cancel { error } => {
                self.db
                    .finish_task(&task.id, TaskStatus::Cancelled, error, now)
            }
        };

        match written {
            Ok(true) => {
                match transition {
                    Transition::Complete { .. } => {
                        tracing::info!("✅ Task {} ({}) completed", task.id, task.task_type)
                    }
                    Transition::Retry {
                        retry_count,
                        scheduled_for,
                        error,
                    } => tracing::warn!(
                        "🔁 Task {} retry {}/{} at {}: {}",
                        task.id,
                        retry_count,
                        task.max_retries,
                        scheduled_for,
                        error
                    ),
                    Transition::Fail { error } => {
                        tracing::warn!("❌ Task {} failed: {}", task.id, error)
                    }
                    Transition::Cancel { .. } => {
                        tracing::info!("🚫 Task {} cancelled", task.id)
                    }
                }
                true
            }
            Ok(false) => {
                tracing::warn!(
                    "⚠️ Task {} changed underneath the dispatcher; {} not written",
                    task.id,
                    transition.label()
                );
                false
            }
            Err(e) => {
                // left in processing; stale-claim recovery handles it
                tracing::warn!("⚠️ Failed to persist {} for task {}: {e}", transition.label(), task.id);
                false
            }
        }
    }

    /// Treat claims older than the claim lease as a transient failure.
    fn recover_stale_claims(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<usize> {
        let stale = self.db.stale_claims(now - self.claim_lease)?;
        let mut recovered = 0;
        for task in stale {
            let result = Err(HandlerError::Transient("claim lease expired".into()));
            let transition = decide(&task, &result, &self.retry, now);
            tracing::warn!("🩹 Recovering stale claim on task {}", task.id);
            if self.persist(&task, &transition) {
                report.count(&transition);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Enqueue advance tasks for enrollments whose next step is due.
    fn enqueue_due_steps(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut enqueued = 0;
        for enrollment in self.db.enrollments(Some(EnrollmentStatus::Active))? {
            let Some(campaign) = self.catalog.get(&enrollment.campaign_name) else {
                tracing::warn!(
                    "⚠️ Enrollment {} references unknown campaign '{}'",
                    enrollment.id,
                    enrollment.campaign_name
                );
                continue;
            };
            let Some(step) = next_due_step(&enrollment, campaign, now) else {
                continue;
            };
            let owner = self
                .db
                .get_contact(&enrollment.contact_id)?
                .map(|c| c.owner_id)
                .unwrap_or_else(|| "system".to_string());
            let due_at = step_due_at(&enrollment, campaign, step).unwrap_or(now);
            let task = NewTask::new(
                &owner,
                TaskType::AdvanceDripStep,
                serde_json::json!({ "enrollment_id": enrollment.id, "step": step }),
                due_at,
            )
            .with_max_retries(self.retry.default_max_retries)
            .created_by("dispatcher")
            .with_dedupe_key(drip_dedupe_key(&enrollment.id, step));

            if self.db.insert_task(&task, now)?.is_some() {
                tracing::info!(
                    "📅 Drip '{}' step {step} queued for enrollment {}",
                    campaign.name,
                    enrollment.id
                );
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

/// Run the dispatcher forever on a fixed interval.
pub async fn spawn_dispatcher(dispatcher: Arc<Dispatcher>, tick_every: std::time::Duration) {
    tracing::info!("⏰ Dispatcher started (tick every {}s)", tick_every.as_secs());
    let mut interval = tokio::time::interval(tick_every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match dispatcher.tick_if_leader().await {
            Ok(Some(report)) if !report.is_idle() => tracing::info!(
                "⏱️ Tick: {} claimed, {} completed, {} retried, {} failed, {} cancelled, {} queued",
                report.claimed,
                report.completed,
                report.retried,
                report.failed,
                report.cancelled,
                report.enqueued
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!("⚠️ Tick aborted: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DryRunProvider;
    use crate::drip::{DripCampaign, DripStep};
    use crate::enrollment::Contact;
    use crate::handlers::{ActionHandler, CustomHandler};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use leadpulse_core::clock::FakeClock;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    /// Returns scripted results in order, then succeeds.
    struct Scripted {
        script: Mutex<VecDeque<std::result::Result<HandlerOutput, HandlerError>>>,
        always_fail: bool,
        calls: AtomicU32,
    }

    impl Scripted {
        fn failing_times(n: usize) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(
                    (0..n)
                        .map(|_| Err(HandlerError::Transient("smtp timeout".into())))
                        .collect(),
                ),
                always_fail: false,
                calls: AtomicU32::new(0),
            })
        }

        fn always_failing() -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                always_fail: true,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ActionHandler for Scripted {
        fn task_type(&self) -> TaskType {
            TaskType::SendEmail
        }

        async fn handle(
            &self,
            _: &TaskContext,
            _: &serde_json::Value,
        ) -> std::result::Result<HandlerOutput, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.always_fail {
                return Err(HandlerError::Transient("smtp timeout".into()));
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(HandlerOutput::empty()))
        }
    }

    /// Cancels its own task mid-attempt, then fails.
    struct CancelsItself(Arc<SchedulerDb>);

    #[async_trait]
    impl ActionHandler for CancelsItself {
        fn task_type(&self) -> TaskType {
            TaskType::SendEmail
        }

        async fn handle(
            &self,
            ctx: &TaskContext,
            _: &serde_json::Value,
        ) -> std::result::Result<HandlerOutput, HandlerError> {
            self.0.cancel_task(&ctx.task_id, ctx.now).unwrap();
            Err(HandlerError::Transient("connection reset".into()))
        }
    }

    /// Panics for one recipient, succeeds for everyone else.
    struct PanicsFor(&'static str);

    #[async_trait]
    impl ActionHandler for PanicsFor {
        fn task_type(&self) -> TaskType {
            TaskType::SendEmail
        }

        async fn handle(
            &self,
            _: &TaskContext,
            payload: &serde_json::Value,
        ) -> std::result::Result<HandlerOutput, HandlerError> {
            if payload["to"] == self.0 {
                panic!("template engine blew up");
            }
            Ok(HandlerOutput::empty())
        }
    }

    fn dispatcher_with(
        db: Arc<SchedulerDb>,
        handler: Arc<dyn ActionHandler>,
        clock: &FakeClock,
    ) -> Dispatcher {
        let mut handlers = HandlerRegistry::new();
        handlers.register(handler);
        Dispatcher::new(
            db,
            handlers,
            Arc::new(CampaignCatalog::default()),
            Arc::new(clock.clone()),
        )
    }

    fn schedule_email(db: &SchedulerDb, at: DateTime<Utc>) -> ScheduledTask {
        let task = NewTask::new(
            "acme",
            TaskType::SendEmail,
            serde_json::json!({"to": "ana@example.com", "subject": "Hi", "body": "Hello"}),
            at,
        );
        db.insert_task(&task, at).unwrap().unwrap()
    }

    /// Tick, then jump past the longest backoff; repeat.
    async fn drive(dispatcher: &Dispatcher, clock: &FakeClock, ticks: usize) {
        for _ in 0..ticks {
            dispatcher.tick().await.unwrap();
            clock.advance(Duration::hours(2));
        }
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let clock = FakeClock::new(t0());
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let handler = Scripted::failing_times(3);
        let dispatcher = dispatcher_with(db.clone(), handler.clone(), &clock);
        let task = schedule_email(&db, t0());

        drive(&dispatcher, &clock, 6).await;

        let done = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.retry_count, 3);
        assert!(done.executed_at.is_some());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_always_failing_task_exhausts_retries() {
        let clock = FakeClock::new(t0());
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let handler = Scripted::always_failing();
        let dispatcher = dispatcher_with(db.clone(), handler.clone(), &clock);
        let task = schedule_email(&db, t0());

        drive(&dispatcher, &clock, 10).await;

        let failed = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 3);
        assert!(failed.error.unwrap().contains("retries exhausted"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let clock = FakeClock::new(t0());
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let handler = Scripted::failing_times(1);
        let dispatcher = dispatcher_with(db.clone(), handler.clone(), &clock);
        let task = schedule_email(&db, t0());

        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.retried, 1);
        let pending = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(pending.status, TaskStatus::Pending);
        assert_eq!(pending.scheduled_for, t0() + Duration::minutes(1));

        clock.advance(Duration::seconds(59));
        assert_eq!(dispatcher.tick().await.unwrap().claimed, 0);
        clock.advance(Duration::seconds(1));
        assert_eq!(dispatcher.tick().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_two_dispatchers_never_double_run() {
        let clock = FakeClock::new(t0());
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let handler = Scripted::failing_times(0);
        let a = dispatcher_with(db.clone(), handler.clone(), &clock);
        let b = dispatcher_with(db.clone(), handler.clone(), &clock);
        for _ in 0..25 {
            schedule_email(&db, t0());
        }

        let (ra, rb) = tokio::join!(a.tick(), b.tick());
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.claimed + rb.claimed, 25);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 25);
        assert_eq!(db.status_counts().unwrap().completed, 25);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_retried_and_tick_continues() {
        let clock = FakeClock::new(t0());
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let dispatcher = dispatcher_with(db.clone(), Arc::new(PanicsFor("boom@example.com")), &clock);
        let healthy = schedule_email(&db, t0());
        let doomed = db
            .insert_task(
                &NewTask::new(
                    "acme",
                    TaskType::SendEmail,
                    serde_json::json!({"to": "boom@example.com", "subject": "Hi", "body": "Hello"}),
                    t0(),
                ),
                t0(),
            )
            .unwrap()
            .unwrap();

        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.retried, 1);
        assert_eq!(db.get_task(&healthy.id).unwrap().unwrap().status, TaskStatus::Completed);

        let retried = db.get_task(&doomed.id).unwrap().unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error.unwrap().contains("template engine blew up"));
    }

    #[tokio::test]
    async fn test_cancel_during_attempt_ends_cancelled() {
        let clock = FakeClock::new(t0());
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let dispatcher = dispatcher_with(db.clone(), Arc::new(CancelsItself(db.clone())), &clock);
        let task = schedule_email(&db, t0());

        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(db.get_task(&task.id).unwrap().unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_permanently() {
        let clock = FakeClock::new(t0());
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new(
            db.clone(),
            HandlerRegistry::new(),
            Arc::new(CampaignCatalog::default()),
            Arc::new(clock.clone()),
        );
        let task = schedule_email(&db, t0());
        dispatcher.tick().await.unwrap();

        let failed = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 0);
    }

    #[tokio::test]
    async fn test_stale_claim_is_retried() {
        let clock = FakeClock::new(t0());
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let dispatcher = dispatcher_with(db.clone(), Scripted::failing_times(0), &clock)
            .with_claim_lease(Duration::minutes(15));
        let task = schedule_email(&db, t0());
        db.claim_task(&task.id, t0()).unwrap();

        clock.advance(Duration::minutes(20));
        let report = dispatcher.tick().await.unwrap();
        assert_eq!(report.recovered, 1);

        let back = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(back.status, TaskStatus::Pending);
        assert_eq!(back.retry_count, 1);
        assert_eq!(back.error.as_deref(), Some("transient failure: claim lease expired"));
    }

    #[tokio::test]
    async fn test_only_lease_holder_ticks() {
        let clock = FakeClock::new(t0());
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let a = dispatcher_with(db.clone(), Scripted::failing_times(0), &clock)
            .with_leader_lease("node-a", Duration::minutes(3));
        let b = dispatcher_with(db.clone(), Scripted::failing_times(0), &clock)
            .with_leader_lease("node-b", Duration::minutes(3));

        assert!(a.tick_if_leader().await.unwrap().is_some());
        assert!(b.tick_if_leader().await.unwrap().is_none());
        a.release_lease().unwrap();
        assert!(b.tick_if_leader().await.unwrap().is_some());
    }

    // ─── drip scenarios ─────────────────────────────────────

    struct Drip {
        clock: FakeClock,
        db: Arc<SchedulerDb>,
        provider: Arc<DryRunProvider>,
        dispatcher: Dispatcher,
        enrollment_id: String,
    }

    fn drip_setup(delays: &[u32]) -> Drip {
        let clock = FakeClock::new(t0());
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let mut catalog = CampaignCatalog::default();
        catalog.insert(DripCampaign {
            name: "nurture".into(),
            steps: delays
                .iter()
                .enumerate()
                .map(|(i, d)| DripStep {
                    delay_days: *d,
                    subject: format!("Step {}", i + 1),
                    body: "Hi {{first_name}}".into(),
                })
                .collect(),
        });
        let catalog = Arc::new(catalog);
        let provider = Arc::new(DryRunProvider::new());
        let handlers = HandlerRegistry::standard(
            db.clone(),
            catalog.clone(),
            provider.clone(),
            CustomHandler::new(),
        );

        let contact = Contact::new("acme", "ana@example.com", Some("Ana"));
        db.upsert_contact(&contact).unwrap();
        let enrollment = db.insert_enrollment(&contact.id, "nurture", t0()).unwrap();

        let dispatcher = Dispatcher::new(db.clone(), handlers, catalog, Arc::new(clock.clone()));
        Drip {
            clock,
            db,
            provider,
            dispatcher,
            enrollment_id: enrollment.id,
        }
    }

    #[tokio::test]
    async fn test_drip_steps_follow_delays() {
        let d = drip_setup(&[0, 3, 4]);
        for _ in 0..=10 {
            d.dispatcher.tick().await.unwrap();
            d.clock.advance(Duration::days(1));
        }

        let e = d.db.get_enrollment(&d.enrollment_id).unwrap().unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert_eq!(e.current_step, 3);
        assert_eq!(e.sent_at(1), Some(t0()));
        assert_eq!(e.sent_at(2), Some(t0() + Duration::days(3)));
        assert_eq!(e.sent_at(3), Some(t0() + Duration::days(7)));
        assert_eq!(d.provider.deliveries().len(), 3);
        assert_eq!(d.db.status_counts().unwrap().completed, 3);
    }

    #[tokio::test]
    async fn test_response_stops_drip() {
        let d = drip_setup(&[0, 3, 4]);
        for day in 0..=10 {
            if day == 2 {
                d.db.record_response(&d.enrollment_id, d.clock.now()).unwrap();
            }
            d.dispatcher.tick().await.unwrap();
            d.clock.advance(Duration::days(1));
        }

        let e = d.db.get_enrollment(&d.enrollment_id).unwrap().unwrap();
        assert_eq!(e.current_step, 1);
        assert!(e.sent_at(2).is_none());
        assert!(e.sent_at(3).is_none());
        assert_eq!(d.provider.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_ticks_enqueue_step_once() {
        let d = drip_setup(&[0, 3]);
        let first = d.dispatcher.enqueue_due_steps(t0()).unwrap();
        let second = d.dispatcher.enqueue_due_steps(t0()).unwrap();
        assert_eq!((first, second), (1, 0));
    }
}
