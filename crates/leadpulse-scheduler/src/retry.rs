//! Retry/backoff controller.
//!
//! `decide` turns a handler result into the next persisted state of the
//! task. It is pure: the dispatcher applies the returned [`Transition`].

use chrono::{DateTime, Duration, Utc};
use leadpulse_core::config::RetryConfig;
use serde::{Deserialize, Serialize};

use crate::handlers::{HandlerError, HandlerOutput};
use crate::tasks::ScheduledTask;

/// Prefix of the error recorded when the retry budget runs out.
pub const RETRIES_EXHAUSTED: &str = "retries exhausted";

/// Exponential backoff: `base * 2^(retry_count - 1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub default_max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::minutes(1),
            max_delay: Duration::hours(1),
            default_max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::seconds(config.base_delay_secs as i64),
            max_delay: Duration::seconds(config.max_delay_secs as i64),
            default_max_retries: config.default_max_retries,
        }
    }

    /// Delay before attempt number `retry_count + 1` (`retry_count` ≥ 1).
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(30);
        let factor = 1i32 << exponent;
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }
}

/// Whether retrying can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// The next state of a processed task.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Complete {
        executed_at: DateTime<Utc>,
        output: Option<serde_json::Value>,
    },
    Retry {
        retry_count: u32,
        scheduled_for: DateTime<Utc>,
        error: String,
    },
    Fail {
        error: String,
    },
    /// Cancel arrived mid-attempt and the attempt failed.
    Cancel {
        error: String,
    },
}

impl Transition {
    pub fn label(&self) -> &'static str {
        match self {
            Transition::Complete { .. } => "completed",
            Transition::Retry { .. } => "retry",
            Transition::Fail { .. } => "failed",
            Transition::Cancel { .. } => "cancelled",
        }
    }
}

/// Decide what happens to `task` after one attempt.
pub fn decide(
    task: &ScheduledTask,
    result: &Result<HandlerOutput, HandlerError>,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Transition {
    let err = match result {
        Ok(output) => {
            return Transition::Complete {
                executed_at: now,
                output: output.to_json(),
            };
        }
        Err(err) => err,
    };

    if task.cancel_requested {
        return Transition::Cancel {
            error: format!("cancelled during attempt: {err}"),
        };
    }

    if err.kind() == FailureKind::Permanent {
        return Transition::Fail {
            error: err.to_string(),
        };
    }

    let next = task.retry_count + 1;
    if next > task.max_retries {
        return Transition::Fail {
            error: format!(
                "{RETRIES_EXHAUSTED} after {} attempts: {err}",
                task.retry_count + 1
            ),
        };
    }

    Transition::Retry {
        retry_count: next,
        scheduled_for: now + policy.backoff(next),
        error: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{TaskStatus, TaskType};
    use proptest::prelude::*;

    fn task(retry_count: u32, max_retries: u32) -> ScheduledTask {
        let now = Utc::now();
        ScheduledTask {
            id: "t1".into(),
            owner_id: "acme".into(),
            task_type: TaskType::SendEmail,
            payload: serde_json::json!({}),
            status: TaskStatus::Processing,
            scheduled_for: now,
            claimed_at: Some(now),
            executed_at: None,
            error: None,
            output: None,
            retry_count,
            max_retries,
            cancel_requested: false,
            dedupe_key: None,
            created_by: "test".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::minutes(1));
        assert_eq!(policy.backoff(2), Duration::minutes(2));
        assert_eq!(policy.backoff(3), Duration::minutes(4));
        assert_eq!(policy.backoff(7), Duration::minutes(60));
        assert_eq!(policy.backoff(40), Duration::minutes(60));
    }

    #[test]
    fn test_success_completes() {
        let now = Utc::now();
        let out = HandlerOutput::with_data(serde_json::json!({"ok": true}));
        match decide(&task(0, 3), &Ok(out), &RetryPolicy::default(), now) {
            Transition::Complete { executed_at, output } => {
                assert_eq!(executed_at, now);
                assert_eq!(output, Some(serde_json::json!({"ok": true})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_transient_retries_until_budget_spent() {
        let now = Utc::now();
        let policy = RetryPolicy::default();
        let err: Result<HandlerOutput, HandlerError> =
            Err(HandlerError::Transient("timeout".into()));

        assert_eq!(
            decide(&task(0, 3), &err, &policy, now),
            Transition::Retry {
                retry_count: 1,
                scheduled_for: now + Duration::minutes(1),
                error: "transient failure: timeout".into(),
            }
        );
        assert!(matches!(
            decide(&task(2, 3), &err, &policy, now),
            Transition::Retry { retry_count: 3, .. }
        ));
        match decide(&task(3, 3), &err, &policy, now) {
            Transition::Fail { error } => assert!(error.contains("retries exhausted")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_permanent_and_config_errors_never_retry() {
        let now = Utc::now();
        let policy = RetryPolicy::default();
        let permanent = Err(HandlerError::Permanent("bad address".into()));
        let config = Err(HandlerError::Configuration("missing 'to'".into()));
        assert!(matches!(decide(&task(0, 3), &permanent, &policy, now), Transition::Fail { .. }));
        assert!(matches!(decide(&task(0, 3), &config, &policy, now), Transition::Fail { .. }));
    }

    #[test]
    fn test_cancel_requested_stops_retry() {
        let now = Utc::now();
        let mut t = task(0, 3);
        t.cancel_requested = true;
        let err = Err(HandlerError::Transient("timeout".into()));
        assert!(matches!(
            decide(&t, &err, &RetryPolicy::default(), now),
            Transition::Cancel { .. }
        ));
        // a successful attempt still completes
        assert!(matches!(
            decide(&t, &Ok(HandlerOutput::empty()), &RetryPolicy::default(), now),
            Transition::Complete { .. }
        ));
    }

    #[test]
    fn test_zero_max_retries_fails_first_time() {
        let err = Err(HandlerError::Transient("rate limited".into()));
        assert!(matches!(
            decide(&task(0, 0), &err, &RetryPolicy::default(), Utc::now()),
            Transition::Fail { .. }
        ));
    }

    proptest! {
        #[test]
        fn prop_retry_schedule_strictly_increases_below_cap(
            base_secs in 1i64..600,
            retries in 1u32..12,
        ) {
            let policy = RetryPolicy {
                base_delay: Duration::seconds(base_secs),
                max_delay: Duration::seconds(base_secs << 12),
                default_max_retries: retries,
            };
            let err: Result<HandlerOutput, HandlerError> =
                Err(HandlerError::Transient("flaky".into()));
            let mut t = task(0, retries);
            let mut now = Utc::now();
            let mut last: Option<DateTime<Utc>> = None;

            loop {
                match decide(&t, &err, &policy, now) {
                    Transition::Retry { retry_count, scheduled_for, .. } => {
                        prop_assert!(scheduled_for > now);
                        if let Some(prev) = last {
                            prop_assert!(scheduled_for > prev);
                        }
                        if retry_count > 1 {
                            prop_assert!(policy.backoff(retry_count) > policy.backoff(retry_count - 1));
                        }
                        last = Some(scheduled_for);
                        t.retry_count = retry_count;
                        now = scheduled_for;
                    }
                    Transition::Fail { .. } => break,
                    other => prop_assert!(false, "unexpected {:?}", other),
                }
            }
            prop_assert_eq!(t.retry_count, retries);
        }
    }
}
