//! # LeadPulse Scheduler
//!
//! Durable task queue and drip-campaign execution engine.
//!
//! ## Architecture
//! ```text
//! Dispatcher (tokio interval, leader lease)
//!   ├── recover stale claims ──► retry controller
//!   ├── enrollments ──► eligibility ──► advance-drip-step tasks (deduped)
//!   ├── due tasks ──► atomic claim (pending → processing)
//!   └── handlers (bounded concurrency)
//!         ├── send-email / send-notification ──► DeliveryProvider
//!         ├── update-lead-score ──► score ledger
//!         ├── advance-drip-step ──► DeliveryProvider + step record
//!         └── custom ──► named CustomAction
//!       result ──► retry::decide ──► completed | pending (backoff) | failed | cancelled
//! ```

pub mod decision_log;
pub mod delivery;
pub mod drip;
pub mod eligibility;
pub mod engine;
pub mod enrollment;
pub mod handlers;
pub mod inspect;
pub mod persistence;
pub mod retry;
pub mod service;
pub mod tasks;

pub use decision_log::{DecisionRecord, DecisionUpdate};
pub use delivery::{DeliveryProvider, DryRunProvider, HttpDeliveryProvider, provider_from_config};
pub use drip::{CampaignCatalog, DripCampaign, DripStep};
pub use engine::{Dispatcher, TickReport, spawn_dispatcher};
pub use enrollment::{Contact, Enrollment, EnrollmentStatus};
pub use handlers::{
    ActionHandler, CustomAction, CustomHandler, HandlerError, HandlerOutput, HandlerRegistry,
    TaskContext,
};
pub use inspect::Inspector;
pub use persistence::SchedulerDb;
pub use retry::{RetryPolicy, Transition};
pub use service::{ResponseOutcome, SchedulerService};
pub use tasks::{CancelOutcome, NewTask, ScheduledTask, TaskStatus, TaskType};
