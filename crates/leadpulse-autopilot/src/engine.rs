//! Decision Engine: runs the rule pass, gates execution on confidence and
//! learns from reported outcomes.
//!
//! ## Flow
//! ```text
//! Snapshot → rules (in order) → proposals
//!   → skip if the same decision is open or closed within repeat_after
//!   → confidence = base + calibration[type]   (clamped 0..=1)
//!   → ≥ threshold: Approved          < threshold: PendingApproval
//! executor outcome → confidence ±, calibration[type] ±
//! ```
//!
//! Decisions and calibration live in the scheduler database, so a separate
//! process (the CLI) can approve or reject while the autopilot is running.

use chrono::{DateTime, Duration, Utc};
use leadpulse_core::clock::Clock;
use leadpulse_core::config::AutopilotConfig;
use leadpulse_core::error::{LeadPulseError, Result};
use leadpulse_scheduler::{DecisionUpdate, SchedulerDb};
use std::collections::HashSet;
use std::sync::Arc;

use crate::decision::{Decision, DecisionStatus, DecisionType, Outcome};
use crate::rules::{Rule, default_rules};
use crate::snapshot::Snapshot;

/// Calibration per decision type never moves further than this.
pub const MAX_CALIBRATION: f64 = 0.5;

pub struct DecisionEngine {
    rules: Vec<Rule>,
    auto_execute_threshold: f64,
    history_limit: usize,
    approval_ttl: Duration,
    max_pending: usize,
    repeat_after: Duration,
    db: Arc<SchedulerDb>,
    clock: Arc<dyn Clock>,
}

impl DecisionEngine {
    pub fn new(
        rules: Vec<Rule>,
        auto_execute_threshold: f64,
        db: Arc<SchedulerDb>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::from_parts(rules, &AutopilotConfig::default(), db, clock)
            .with_threshold(auto_execute_threshold)
    }

    pub fn from_config(config: &AutopilotConfig, db: Arc<SchedulerDb>, clock: Arc<dyn Clock>) -> Self {
        Self::from_parts(default_rules(), config, db, clock)
    }

    fn from_parts(
        rules: Vec<Rule>,
        config: &AutopilotConfig,
        db: Arc<SchedulerDb>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rules,
            auto_execute_threshold: config.auto_execute_threshold,
            history_limit: config.history_limit.max(1),
            approval_ttl: secs(config.approval_ttl_secs),
            max_pending: config.max_pending.max(1),
            repeat_after: secs(config.repeat_after_secs),
            db,
            clock,
        }
    }

    fn with_threshold(mut self, threshold: f64) -> Self {
        self.auto_execute_threshold = threshold;
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Run every rule and record one decision per new proposal. Returns the
    /// decisions created by this pass.
    pub fn evaluate(&self, snapshot: &Snapshot) -> Result<Vec<Decision>> {
        let now = self.clock.now();
        let expired = self.db.expire_decisions(
            DecisionStatus::PendingApproval.as_str(),
            DecisionStatus::Expired.as_str(),
            now.checked_sub_signed(self.approval_ttl).unwrap_or(DateTime::<Utc>::MIN_UTC),
            "not approved in time",
            now,
        )?;
        if expired > 0 {
            tracing::info!("⌛ {expired} held decision(s) expired");
        }

        let mut seen = HashSet::new();
        let mut fresh = Vec::new();
        for rule in &self.rules {
            for proposal in (rule.evaluate)(snapshot) {
                let fingerprint = proposal.fingerprint();
                if !seen.insert(fingerprint.clone()) || self.is_repeat(&fingerprint, now)? {
                    tracing::debug!("🔁 Rule '{}' repeats {fingerprint}", rule.name);
                    continue;
                }

                let offset = self.calibration(proposal.decision_type)?;
                let confidence = (proposal.confidence + offset).clamp(0.0, 1.0);
                let status = if confidence >= self.auto_execute_threshold {
                    DecisionStatus::Approved
                } else {
                    DecisionStatus::PendingApproval
                };
                tracing::info!(
                    "🧠 Rule '{}' proposes {} ({:.2}{}): {}",
                    rule.name,
                    proposal.decision_type,
                    confidence,
                    if status == DecisionStatus::PendingApproval { ", needs approval" } else { "" },
                    proposal.reasoning
                );
                let decision = Decision {
                    id: uuid::Uuid::new_v4().to_string(),
                    decision_type: proposal.decision_type,
                    rule: rule.name.to_string(),
                    fingerprint,
                    reasoning: proposal.reasoning,
                    action: proposal.action,
                    confidence,
                    timestamp: now,
                    status,
                    execution_ref: None,
                    error: None,
                    updated_at: now,
                };
                self.db.insert_decision(&decision.to_record())?;
                fresh.push(decision);
            }
        }

        let capped = self.db.cap_decisions(
            DecisionStatus::PendingApproval.as_str(),
            DecisionStatus::Expired.as_str(),
            self.max_pending,
            "approval queue full",
            now,
        )?;
        if capped > 0 {
            tracing::warn!("⚠️ Approval queue full: {capped} oldest held decision(s) expired");
        }
        let terminal = DecisionStatus::TERMINAL.map(|s| s.as_str());
        self.db.prune_decisions(&terminal, self.history_limit)?;
        Ok(fresh)
    }

    /// The same decision is still open, or closed too recently to propose again.
    fn is_repeat(&self, fingerprint: &str, now: DateTime<Utc>) -> Result<bool> {
        let Some(latest) = self.db.latest_decision_with_fingerprint(fingerprint)? else {
            return Ok(false);
        };
        let status: DecisionStatus = latest.status.parse()?;
        Ok(status.is_open() || now - latest.updated_at < self.repeat_after)
    }

    /// Apply an executor outcome. Returns the decision's new confidence.
    /// Each decision takes exactly one outcome.
    pub fn record_outcome(&self, id: &str, outcome: Outcome) -> Result<f64> {
        self.finish(id, outcome, None)
    }

    /// Failure outcome that keeps the executor's error on the decision.
    pub fn record_failure(&self, id: &str, error: &str) -> Result<f64> {
        self.finish(id, Outcome::Failure, Some(error))
    }

    fn finish(&self, id: &str, outcome: Outcome, error: Option<&str>) -> Result<f64> {
        let decision = self.require(id)?;
        if !matches!(decision.status, DecisionStatus::Approved | DecisionStatus::Executing) {
            return Err(LeadPulseError::InvalidState(format!(
                "decision {id} is {}, cannot take an outcome",
                decision.status
            )));
        }
        let delta = outcome.adjustment();
        let confidence = (decision.confidence + delta).clamp(0.0, 1.0);
        let update = DecisionUpdate {
            error,
            confidence: Some(confidence),
            ..Default::default()
        };
        let moved = self.db.update_decision(
            id,
            &[DecisionStatus::Approved.as_str(), DecisionStatus::Executing.as_str()],
            outcome.status().as_str(),
            update,
            self.clock.now(),
        )?;
        if !moved {
            return Err(LeadPulseError::InvalidState(format!(
                "decision {id} already took an outcome"
            )));
        }

        let decision_type = decision.decision_type;
        let offset = self
            .db
            .adjust_decision_calibration(decision_type.as_str(), delta, MAX_CALIBRATION)?;
        tracing::info!(
            "📊 {decision_type} {id} → {outcome:?}; confidence {confidence:.2}, calibration {offset:+.2}"
        );
        Ok(confidence)
    }

    /// Clear a held decision for execution.
    pub fn approve(&self, id: &str) -> Result<Decision> {
        self.transition_pending(id, DecisionStatus::Approved)
    }

    pub fn reject(&self, id: &str) -> Result<Decision> {
        self.transition_pending(id, DecisionStatus::Rejected)
    }

    /// Record that the executor took the decision, under `reference`.
    /// False when the decision was no longer approved.
    pub fn mark_executing(&self, id: &str, reference: &str) -> Result<bool> {
        let update = DecisionUpdate {
            execution_ref: Some(reference),
            ..Default::default()
        };
        self.db.update_decision(
            id,
            &[DecisionStatus::Approved.as_str()],
            DecisionStatus::Executing.as_str(),
            update,
            self.clock.now(),
        )
    }

    /// The application was cancelled before it ran. No outcome is learned.
    pub fn mark_cancelled(&self, id: &str) -> Result<bool> {
        let update = DecisionUpdate {
            error: Some("application cancelled"),
            ..Default::default()
        };
        self.db.update_decision(
            id,
            &[DecisionStatus::Executing.as_str()],
            DecisionStatus::Cancelled.as_str(),
            update,
            self.clock.now(),
        )
    }

    /// Decisions cleared to run but not yet handed to an executor.
    pub fn ready(&self) -> Result<Vec<Decision>> {
        self.with_status(DecisionStatus::Approved)
    }

    /// Decisions whose application is in flight.
    pub fn executing(&self) -> Result<Vec<Decision>> {
        self.with_status(DecisionStatus::Executing)
    }

    pub fn pending_approval(&self) -> Result<Vec<Decision>> {
        self.with_status(DecisionStatus::PendingApproval)
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.db.count_decisions(DecisionStatus::PendingApproval.as_str())
    }

    /// Most recent decisions, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<Decision>> {
        self.db
            .recent_decisions(limit)?
            .into_iter()
            .map(Decision::try_from)
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<Option<Decision>> {
        self.db.get_decision(id)?.map(Decision::try_from).transpose()
    }

    pub fn calibration(&self, decision_type: DecisionType) -> Result<f64> {
        self.db.decision_calibration(decision_type.as_str())
    }

    fn with_status(&self, status: DecisionStatus) -> Result<Vec<Decision>> {
        self.db
            .decisions_with_status(status.as_str(), usize::MAX)?
            .into_iter()
            .map(Decision::try_from)
            .collect()
    }

    fn require(&self, id: &str) -> Result<Decision> {
        self.get(id)?
            .ok_or_else(|| LeadPulseError::NotFound(format!("decision {id}")))
    }

    fn transition_pending(&self, id: &str, to: DecisionStatus) -> Result<Decision> {
        let moved = self.db.update_decision(
            id,
            &[DecisionStatus::PendingApproval.as_str()],
            to.as_str(),
            DecisionUpdate::default(),
            self.clock.now(),
        )?;
        let decision = self.require(id)?;
        if !moved {
            return Err(LeadPulseError::InvalidState(format!(
                "decision {id} is {}, not awaiting approval",
                decision.status
            )));
        }
        tracing::info!("👤 Decision {id} {to}");
        Ok(decision)
    }
}

fn secs(s: u64) -> Duration {
    Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Proposal;
    use crate::snapshot::{Agent, AgentStatus, Campaign, CampaignStatus, Company};
    use leadpulse_core::clock::FakeClock;

    fn scenario_snapshot() -> Snapshot {
        let mut s = Snapshot::empty();
        s.companies = vec![
            Company {
                id: "north".into(),
                name: "North".into(),
            },
            Company {
                id: "south".into(),
                name: "South".into(),
            },
            Company {
                id: "acme".into(),
                name: "Acme".into(),
            },
        ];
        s.campaigns = vec![Campaign {
            id: "spring".into(),
            company_id: "acme".into(),
            name: "Spring".into(),
            status: CampaignStatus::Active,
            target_conversions: 0,
            conversions: 0,
            sent: 0,
            replies: 0,
            assigned_agent_id: None,
        }];
        s.agents = vec![Agent {
            id: "rae".into(),
            name: "Rae".into(),
            status: AgentStatus::Idle,
        }];
        s
    }

    fn engine_with(rules: Vec<Rule>) -> (DecisionEngine, FakeClock) {
        let clock = FakeClock::default();
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        (DecisionEngine::new(rules, 0.8, db, Arc::new(clock.clone())), clock)
    }

    fn engine() -> (DecisionEngine, FakeClock) {
        engine_with(default_rules())
    }

    /// Always proposes the same pause at 0.75.
    fn below_gate() -> Rule {
        Rule {
            name: "below_gate",
            evaluate: |_| {
                vec![Proposal::new(
                    DecisionType::PauseCampaign,
                    0.75,
                    "always",
                    serde_json::json!({}),
                )]
            },
        }
    }

    /// One pause per active campaign, all below the gate.
    fn pause_every_campaign() -> Rule {
        Rule {
            name: "pause_every_campaign",
            evaluate: |s| {
                s.active_campaigns()
                    .map(|c| {
                        Proposal::new(
                            DecisionType::PauseCampaign,
                            0.5,
                            "test",
                            serde_json::json!({"campaign_id": c.id}),
                        )
                    })
                    .collect()
            },
        }
    }

    fn find(decisions: &[Decision], t: DecisionType) -> &Decision {
        decisions.iter().find(|d| d.decision_type == t).unwrap()
    }

    #[test]
    fn test_orphans_and_idle_agent() {
        let (engine, _) = engine();
        let decisions = engine.evaluate(&scenario_snapshot()).unwrap();

        let creates: Vec<_> = decisions
            .iter()
            .filter(|d| d.decision_type == DecisionType::CreateCampaign)
            .collect();
        assert_eq!(decisions.len(), 3);
        assert_eq!(creates.len(), 2);
        assert!(creates.iter().all(|d| d.confidence == 0.85));
        assert_eq!(find(&decisions, DecisionType::AssignAgent).confidence, 0.90);
        assert_eq!(engine.history(10).unwrap().len(), 3);
    }

    #[test]
    fn test_threshold_gates_execution() {
        let (mut engine, _) = engine();
        engine.add_rule(below_gate());
        let decisions = engine.evaluate(&scenario_snapshot()).unwrap();
        assert_eq!(decisions.len(), 4);
        assert_eq!(engine.ready().unwrap().len(), 3);
        let held = engine.pending_approval().unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].decision_type, DecisionType::PauseCampaign);

        let approved = engine.approve(&held[0].id).unwrap();
        assert_eq!(approved.status, DecisionStatus::Approved);
        assert!(matches!(
            engine.approve(&held[0].id),
            Err(LeadPulseError::InvalidState(_))
        ));
        assert!(matches!(engine.approve("missing"), Err(LeadPulseError::NotFound(_))));
        assert_eq!(engine.ready().unwrap().len(), 4);
    }

    #[test]
    fn test_reject() {
        let (engine, _) = engine_with(vec![below_gate()]);
        let d = engine.evaluate(&Snapshot::empty()).unwrap().remove(0);
        engine.reject(&d.id).unwrap();
        assert!(engine.pending_approval().unwrap().is_empty());
        assert!(engine.record_outcome(&d.id, Outcome::Success).is_err());
    }

    #[test]
    fn test_approval_from_another_handle_is_visible() {
        let clock = FakeClock::default();
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let running = DecisionEngine::new(vec![below_gate()], 0.8, db.clone(), Arc::new(clock.clone()));
        let operator = DecisionEngine::new(vec![], 0.8, db, Arc::new(clock));

        let held = running.evaluate(&Snapshot::empty()).unwrap().remove(0);
        assert_eq!(operator.pending_approval().unwrap()[0].id, held.id);
        operator.approve(&held.id).unwrap();
        assert_eq!(running.ready().unwrap()[0].id, held.id);
    }

    #[test]
    fn test_outcome_adjusts_confidence_once() {
        let (engine, _) = engine();
        let decisions = engine.evaluate(&scenario_snapshot()).unwrap();
        let assign = find(&decisions, DecisionType::AssignAgent);

        let after = engine.record_outcome(&assign.id, Outcome::Success).unwrap();
        assert!((after - 0.95).abs() < 1e-9);
        assert!(matches!(
            engine.record_outcome(&assign.id, Outcome::Success),
            Err(LeadPulseError::InvalidState(_))
        ));
        assert!(matches!(
            engine.record_outcome("missing", Outcome::Failure),
            Err(LeadPulseError::NotFound(_))
        ));

        let create = find(&decisions, DecisionType::CreateCampaign);
        let after = engine.record_failure(&create.id, "CRM down").unwrap();
        assert!((after - 0.75).abs() < 1e-9);
        let stored = engine.get(&create.id).unwrap().unwrap();
        assert_eq!(stored.status, DecisionStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("CRM down"));
    }

    #[test]
    fn test_confidence_bounds() {
        let (engine, clock) = engine();
        let d = engine.evaluate(&scenario_snapshot()).unwrap();
        engine
            .record_outcome(&find(&d, DecisionType::AssignAgent).id, Outcome::Success)
            .unwrap();
        clock.advance(Duration::days(2));
        let d = engine.evaluate(&scenario_snapshot()).unwrap();
        let assign = find(&d, DecisionType::AssignAgent);
        assert!((assign.confidence - 0.95).abs() < 1e-9);
        let after = engine.record_outcome(&assign.id, Outcome::Success).unwrap();
        assert_eq!(after, 1.0);
    }

    #[test]
    fn test_failures_calibrate_type_below_threshold() {
        let (engine, clock) = engine();
        for _ in 0..2 {
            let d = engine.evaluate(&scenario_snapshot()).unwrap();
            engine
                .record_outcome(&find(&d, DecisionType::AssignAgent).id, Outcome::Failure)
                .unwrap();
            clock.advance(Duration::days(2));
        }
        assert!((engine.calibration(DecisionType::AssignAgent).unwrap() + 0.2).abs() < 1e-9);
        assert_eq!(engine.calibration(DecisionType::CreateCampaign).unwrap(), 0.0);

        // 0.90 - 0.20 = 0.70 is below the gate now
        let d = engine.evaluate(&scenario_snapshot()).unwrap();
        assert_eq!(
            find(&d, DecisionType::AssignAgent).status,
            DecisionStatus::PendingApproval
        );
    }

    #[test]
    fn test_calibration_is_clamped() {
        let (engine, clock) = engine();
        for _ in 0..10 {
            engine.evaluate(&scenario_snapshot()).unwrap();
            for decision in engine.pending_approval().unwrap() {
                engine.approve(&decision.id).unwrap();
            }
            for decision in engine.ready().unwrap() {
                engine.record_outcome(&decision.id, Outcome::Failure).unwrap();
            }
            clock.advance(Duration::days(2));
        }
        assert!(
            (engine.calibration(DecisionType::CreateCampaign).unwrap() + MAX_CALIBRATION).abs()
                < 1e-9
        );
    }

    #[test]
    fn test_repeated_passes_do_not_duplicate_open_decisions() {
        let (mut engine, clock) = engine();
        engine.add_rule(below_gate());
        let first = engine.evaluate(&scenario_snapshot()).unwrap();
        assert_eq!(first.len(), 4);
        for _ in 0..20 {
            clock.advance(Duration::minutes(15));
            assert!(engine.evaluate(&scenario_snapshot()).unwrap().is_empty());
        }
        assert_eq!(engine.pending_approval().unwrap().len(), 1);
        assert_eq!(engine.history(100).unwrap().len(), 4);

        // closed decisions come back only after the repeat window
        for d in engine.ready().unwrap() {
            engine.record_outcome(&d.id, Outcome::Success).unwrap();
        }
        clock.advance(Duration::hours(1));
        assert!(engine.evaluate(&scenario_snapshot()).unwrap().is_empty());
        clock.advance(Duration::days(1));
        assert_eq!(engine.evaluate(&scenario_snapshot()).unwrap().len(), 3);
    }

    #[test]
    fn test_held_decisions_expire_after_ttl() {
        let (engine, clock) = engine_with(vec![below_gate()]);
        let held = engine.evaluate(&Snapshot::empty()).unwrap().remove(0);
        clock.advance(Duration::days(8));
        assert!(engine.evaluate(&Snapshot::empty()).unwrap().is_empty());
        let stored = engine.get(&held.id).unwrap().unwrap();
        assert_eq!(stored.status, DecisionStatus::Expired);
        assert!(engine.pending_approval().unwrap().is_empty());
        assert!(matches!(engine.approve(&held.id), Err(LeadPulseError::InvalidState(_))));
    }

    #[test]
    fn test_approval_queue_is_capped() {
        let mut config = AutopilotConfig::default();
        config.max_pending = 2;
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let mut engine = DecisionEngine::from_config(&config, db, Arc::new(FakeClock::default()));
        engine.rules.clear();
        engine.add_rule(pause_every_campaign());

        let mut snapshot = Snapshot::empty();
        snapshot.campaigns = (0..5)
            .map(|i| Campaign {
                id: format!("c{i}"),
                company_id: "acme".into(),
                name: format!("C{i}"),
                status: CampaignStatus::Active,
                target_conversions: 0,
                conversions: 0,
                sent: 0,
                replies: 0,
                assigned_agent_id: None,
            })
            .collect();
        assert_eq!(engine.evaluate(&snapshot).unwrap().len(), 5);
        let held: Vec<_> = engine
            .pending_approval()
            .unwrap()
            .into_iter()
            .map(|d| d.action["campaign_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(held, vec!["c3", "c4"]);
        assert_eq!(engine.pending_count().unwrap(), 2);
    }

    #[test]
    fn test_history_limit_keeps_open_decisions() {
        let mut config = AutopilotConfig::default();
        config.history_limit = 2;
        let clock = FakeClock::default();
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let engine = DecisionEngine::from_config(&config, db, Arc::new(clock.clone()));
        let first = engine.evaluate(&scenario_snapshot()).unwrap();
        // nothing finished yet, so nothing is dropped
        assert_eq!(engine.history(100).unwrap().len(), 3);
        for d in &first {
            engine.record_outcome(&d.id, Outcome::Success).unwrap();
        }
        clock.advance(Duration::days(2));
        engine.evaluate(&scenario_snapshot()).unwrap();
        let history = engine.history(100).unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(
            history.iter().filter(|d| d.status == DecisionStatus::Succeeded).count(),
            2
        );
    }
}
