use std::time::{Duration, Instant};

/// Stateless reconnection policy: bounded attempts with exponential backoff.
///
/// Applied independently to each subject (the discovery session, or a single
/// peer's negotiation). The delay doubles from `base_delay` per failure and
/// is capped at `max_delay`, so it is non-decreasing in the attempt count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
            .min(self.max_delay)
    }

    /// Create a fresh budget governed by this policy.
    pub fn budget(&self) -> RetryBudget {
        RetryBudget {
            policy: *self,
            attempts: 0,
            next_eligible_at: None,
        }
    }
}

/// Outcome of recording a failure against a budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay; the budget tracks the eligibility time.
    RetryAfter(Duration),
    /// Budget exhausted; the subject is failed until an external reset.
    Exhausted,
}

/// Per-subject retry state. Lives exactly as long as the subject it tracks:
/// dropped on success, or held in the exhausted state until an explicit
/// external reset (fresh discovery event, manual re-enable).
#[derive(Clone, Debug)]
pub struct RetryBudget {
    policy: RetryPolicy,
    attempts: u32,
    next_eligible_at: Option<Instant>,
}

impl RetryBudget {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    /// Whether a retry may run at `now`. Exhausted budgets are never
    /// eligible; otherwise the subject must not run before `next_eligible_at`.
    pub fn is_eligible(&self, now: Instant) -> bool {
        if self.is_exhausted() {
            return false;
        }
        match self.next_eligible_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Record a failed attempt. Returns the backoff decision and, on retry,
    /// stamps the earliest next eligibility time.
    pub fn record_failure(&mut self, now: Instant) -> RetryDecision {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.policy.max_attempts {
            self.next_eligible_at = None;
            return RetryDecision::Exhausted;
        }
        let delay = self.policy.delay_for(self.attempts);
        self.next_eligible_at = Some(now + delay);
        RetryDecision::RetryAfter(delay)
    }

    /// External reset: clears the attempt count and eligibility gate.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_eligible_at = None;
    }
}
