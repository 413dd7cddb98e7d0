//! Bounded retry strategies for polling operations.
//!
//! Every strategy gives up after a finite number of attempts; there is no
//! "poll forever" mode.

use std::time::Duration;

pub trait RetryStrategy: Send + Sync {
    /// Maximum number of attempts, including the first one.
    fn max_attempts(&self) -> u32;

    /// Delay to wait after the given failed attempt (1-based).
    fn delay_after(&self, attempt: u32) -> Duration;
}

/// Try exactly once.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn max_attempts(&self) -> u32 {
        1
    }

    fn delay_after(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Constant delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl RetryStrategy for FixedDelay {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay_after(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Doubling delay, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Upper bound on the total time spent sleeping between attempts.
    pub fn total_budget(&self) -> Duration {
        (1..self.max_attempts).map(|a| self.delay_after(a)).sum()
    }
}

impl Default for ExponentialBackoff {
    /// 250ms doubling to 4s, 12 attempts (~33s of waiting in total).
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(4), 12)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_retry() {
        assert_eq!(NoRetry.max_attempts(), 1);
        assert_eq!(NoRetry.delay_after(1), Duration::ZERO);
    }

    #[test]
    fn test_fixed_delay_at_least_one_attempt() {
        let fixed = FixedDelay::new(Duration::from_millis(1000), 0);
        assert_eq!(fixed.max_attempts(), 1);
        assert_eq!(fixed.delay_after(7), Duration::from_millis(1000));
    }

    #[test]
    fn test_exponential_backoff_doubles_then_caps() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(500), 6);
        assert_eq!(backoff.delay_after(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_after(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_after(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_after(4), Duration::from_millis(500));
        assert_eq!(backoff.delay_after(40), Duration::from_millis(500));
        assert_eq!(backoff.total_budget(), Duration::from_millis(1700));
    }
}
