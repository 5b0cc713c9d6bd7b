//! Decision model: what the worker does after a failed attempt.
//!
//! The Decider is a pure function of the attempt count and the error; the
//! worker carries out the decision (sleep and retry, or finalize as failed).

use std::time::Duration;

use super::errors::HarvestError;
use super::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Run another attempt on the same execution after `delay`.
    Retry { delay: Duration, reason: String },

    /// Give up: the execution and its task become failed.
    Fail { reason: String },
}

pub trait Decider: Send + Sync {
    /// `attempts` is the number of processor invocations made so far.
    fn decide(&self, attempts: u32, error: &HarvestError) -> Decision;
}

/// Retries transient errors with exponential backoff until the budget runs
/// out. Everything else fails immediately.
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, attempts: u32, error: &HarvestError) -> Decision {
        let max = self.retry_policy.max_attempts;
        if !error.is_transient() {
            return Decision::Fail {
                reason: format!("{:?} error is not retryable", error.kind()),
            };
        }
        if !self.retry_policy.has_budget(attempts) {
            return Decision::Fail {
                reason: format!("Max attempts reached: {attempts}/{max}"),
            };
        }
        let delay = self.retry_policy.next_delay(attempts);
        Decision::Retry {
            delay,
            reason: format!("Retry attempt {}/{max} after {delay:?}", attempts + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ProcessorError;

    fn decider() -> DefaultDecider {
        DefaultDecider::new(RetryPolicy::default())
    }

    #[test]
    fn transient_error_retries_with_backoff() {
        let err = HarvestError::from(ProcessorError::transient("503"));
        assert_eq!(
            decider().decide(1, &err),
            Decision::Retry {
                delay: Duration::from_secs(1),
                reason: "Retry attempt 2/3 after 1s".into(),
            }
        );
        assert!(matches!(
            decider().decide(2, &err),
            Decision::Retry { delay, .. } if delay == Duration::from_secs(2)
        ));
    }

    #[test]
    fn budget_exhaustion_fails() {
        let err = HarvestError::Timeout(Duration::from_secs(300));
        assert!(matches!(decider().decide(3, &err), Decision::Fail { .. }));
    }

    #[test]
    fn validation_error_fails_on_first_attempt() {
        let err = HarvestError::from(ProcessorError::validation("missing file"));
        assert!(matches!(decider().decide(1, &err), Decision::Fail { .. }));
    }
}
