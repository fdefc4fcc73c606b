//! Retry decisions for failed step attempts.
//!
//! The decision is a pure function of the failure value and the attempt
//! count: fatal failures never retry, retryable ones retry while the step's
//! attempt budget lasts.

use std::time::Duration;

use conductor_types::config::EngineConfig;
use conductor_types::dsl::{RetryPolicy, StepSpec};

use super::handler::StepFailure;

/// Upper bound on a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Stateless retry handler.
pub struct RetryHandler;

impl RetryHandler {
    /// The step's own policy, or the engine default.
    pub fn policy_for(step: &StepSpec, config: &EngineConfig) -> RetryPolicy {
        step.retry.clone().unwrap_or_else(|| RetryPolicy {
            max_attempts: config.default_step_attempts,
            backoff_ms: config.default_retry_backoff_ms,
            ..RetryPolicy::default()
        })
    }

    /// Whether another attempt should follow.
    ///
    /// `attempt` is 1-based (first execution is attempt 1).
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, failure: &StepFailure) -> bool {
        match failure {
            StepFailure::Fatal(_) => false,
            StepFailure::Retryable(_) => attempt < policy.max_attempts,
        }
    }

    /// Delay before attempt `attempt + 1`.
    pub fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
        if policy.backoff_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let factor = policy.backoff_multiplier.max(1.0).powi(exponent);
        let millis = (policy.backoff_ms as f64 * factor).min(MAX_BACKOFF.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
