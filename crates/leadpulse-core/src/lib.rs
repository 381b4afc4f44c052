//! # LeadPulse Core
//!
//! Pieces shared by every LeadPulse crate: the error type, the TOML
//! configuration and the injectable clock used for all time decisions.

pub mod clock;
pub mod config;
pub mod error;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::LeadPulseConfig;
pub use error::{LeadPulseError, Result};
