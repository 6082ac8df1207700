use std::time::Duration;

/// Backoff schedule applied between failed attempts of the same job.
///
/// `delay(n) = min(base * 2^(n-1), max) + jitter` where `n` is the
/// attempt that just failed. The capped exponential part never shrinks
/// as `n` grows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Upper bound of the uniformly random extra delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(600),
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deterministic part of the delay after `failed_attempt` (1-based).
    pub fn base_delay(&self, failed_attempt: u32) -> Duration {
        let base = (self.base.as_millis() as u64).max(1);
        let max = (self.max.as_millis() as u64).max(base);
        let shift = failed_attempt.saturating_sub(1).min(32);
        let exp = base.saturating_mul(1u64 << shift);
        Duration::from_millis(exp.min(max))
    }

    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        self.base_delay(failed_attempt) + jitter_delay(self.jitter)
    }
}

fn jitter_delay(jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<u128> = (1..=6).map(|n| policy.base_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500, 500]);
    }

    #[test]
    fn schedule_is_monotonic_for_large_attempts() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for n in 1..100 {
            let delay = policy.base_delay(n);
            assert!(delay >= previous);
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(600));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(10))
            .with_jitter(Duration::from_millis(5));
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(15));
        }
    }
}
