//! # LeadPulse Autopilot
//!
//! Periodic rule pass over companies, campaigns and agents. Each rule is an
//! independent pure function; the engine turns proposals into decisions,
//! auto-executes the confident ones and holds the rest for approval.
//! Decisions are stored in the scheduler database.

pub mod decision;
pub mod engine;
pub mod executor;
pub mod rules;
pub mod snapshot;

pub use decision::{Decision, DecisionStatus, DecisionType, Outcome, Proposal};
pub use engine::DecisionEngine;
pub use executor::{
    APPLY_DECISION, ApplyDecisionAction, AutopilotReport, DecisionExecutor, ExecutionState,
    TaskQueueExecutor, execute_ready, run_once, spawn_autopilot,
};
pub use rules::{Rule, default_rules};
pub use snapshot::{JsonFileSource, Snapshot, SnapshotSource, StaticSource};
