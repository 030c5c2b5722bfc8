//! Retry decisions for failed node activities.
//!
//! Retries happen inside the activity-invocation layer: the scheduler only
//! ever sees the final attempt's failure. Stateless, like the rest of the
//! policy helpers; configuration comes in as parameters.

use std::time::Duration;

use weaver_types::execution::{NodeError, NodeErrorKind};
use weaver_types::workflow::RetryConfig;

/// Upper bound on a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct RetryHandler;

impl RetryHandler {
    /// Whether a failed attempt should be retried.
    ///
    /// `attempt` is 1-based. Validation errors, unresolved references, and
    /// cancellations are never retried: rerunning cannot change their outcome.
    pub fn should_retry(config: &RetryConfig, attempt: u32, error: &NodeError) -> bool {
        if matches!(
            error.kind,
            NodeErrorKind::ValidationError
                | NodeErrorKind::UnresolvedReference
                | NodeErrorKind::Cancelled
                | NodeErrorKind::CreditExhausted
        ) {
            return false;
        }
        attempt < config.max_attempts
    }

    /// Delay before attempt `attempt + 1`: `backoff_ms * 2^(attempt - 1)`, capped.
    pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
        if config.backoff_ms == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(config.backoff_ms.saturating_mul(factor)).min(MAX_BACKOFF)
    }
}
