//! Global retry budget for one queue-draining run.

use std::sync::atomic::{AtomicU32, Ordering};

/// What the scheduler should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Budget left; wait the backoff delay and continue.
    Retry { attempt: u32 },
    /// Budget exhausted; abort the whole run.
    Exhausted { attempts: u32 },
}

/// Retry counter shared by every task in a run.
///
/// Any failure increments the counter and any success resets it, so the
/// budget bounds consecutive failures across all tasks, not per task.
#[derive(Debug)]
pub struct RetryBudget {
    max_retries: u32,
    current: AtomicU32,
}

impl RetryBudget {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            current: AtomicU32::new(0),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    pub fn is_exhausted(&self) -> bool {
        self.current() >= self.max_retries
    }

    /// Count one failure.
    pub fn record_failure(&self) -> RetryDecision {
        let attempt = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        if attempt >= self.max_retries {
            RetryDecision::Exhausted { attempts: attempt }
        } else {
            RetryDecision::Retry { attempt }
        }
    }

    /// A task succeeded; the budget starts over.
    pub fn record_success(&self) {
        self.current.store(0, Ordering::Release);
    }

    pub fn reset(&self) {
        self.record_success();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausts_at_max() {
        let budget = RetryBudget::new(3);
        assert_eq!(budget.record_failure(), RetryDecision::Retry { attempt: 1 });
        assert_eq!(budget.record_failure(), RetryDecision::Retry { attempt: 2 });
        assert_eq!(budget.record_failure(), RetryDecision::Exhausted { attempts: 3 });
        assert!(budget.is_exhausted());
    }

    #[test]
    fn test_success_resets_budget() {
        let budget = RetryBudget::new(2);
        budget.record_failure();
        budget.record_success();
        assert_eq!(budget.current(), 0);
        assert_eq!(budget.record_failure(), RetryDecision::Retry { attempt: 1 });
    }

    #[test]
    fn test_single_retry_budget() {
        let budget = RetryBudget::new(1);
        assert_eq!(budget.record_failure(), RetryDecision::Exhausted { attempts: 1 });
    }
}
