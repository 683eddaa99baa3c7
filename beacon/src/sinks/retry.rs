use std::time::Duration;

#[derive(Copy, Clone, Debug)]
/// How a pool worker retries a batch its flusher failed to write.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<Duration>,
    /// Total flush attempts per batch, including the first one. Unbounded
    /// when unset.
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Option<Duration>,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts,
        }
    }

    /// Backoff before the retry following `attempt` failed attempts.
    pub fn time_until_next_retry(&self, attempt: u32) -> Duration {
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(attempt)
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        match (candidate_interval, self.maximum_interval) {
            (Some(candidate), Some(max_interval)) => std::cmp::min(candidate, max_interval),
            (None, Some(max_interval)) => max_interval,
            (Some(candidate), None) => candidate,
            (None, None) => Duration::MAX,
        }
    }

    /// True if another attempt is allowed after `attempts` failed ones.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(100),
            maximum_interval: Some(Duration::from_secs(10)),
            max_attempts: Some(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::new(
            2,
            Duration::from_millis(100),
            Some(Duration::from_secs(1)),
            None,
        );

        assert_eq!(policy.time_until_next_retry(0), Duration::from_millis(100));
        assert_eq!(policy.time_until_next_retry(1), Duration::from_millis(200));
        assert_eq!(policy.time_until_next_retry(3), Duration::from_millis(800));
        assert_eq!(policy.time_until_next_retry(4), Duration::from_secs(1));
        // Would overflow without the checked arithmetic
        assert_eq!(policy.time_until_next_retry(200), Duration::from_secs(1));
    }

    #[test]
    fn attempts_are_bounded_when_configured() {
        let bounded = RetryPolicy::new(2, Duration::from_millis(1), None, Some(3));
        assert!(bounded.should_retry(1));
        assert!(bounded.should_retry(2));
        assert!(!bounded.should_retry(3));

        let unbounded = RetryPolicy::new(2, Duration::from_millis(1), None, None);
        assert!(unbounded.should_retry(u32::MAX));
    }
}
