use std::time::Duration;

/// How many times a conflicting write may be re-attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Keep re-reading and re-applying until the write lands.
    Unbounded,
    /// Give up after this many retries and surface the conflict.
    Bounded(u32),
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `retries` retries already happened.
    pub fn allows(&self, retries: u32) -> bool {
        match self {
            RetryPolicy::Unbounded => true,
            RetryPolicy::Bounded(max) => retries < *max,
        }
    }
}

/// Linear crash-loop delay: `retry_count × base`.
pub fn linear_backoff(base: Duration, retry_count: u32) -> Duration {
    base.saturating_mul(retry_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_always_allows() {
        assert!(RetryPolicy::Unbounded.allows(0));
        assert!(RetryPolicy::Unbounded.allows(u32::MAX));
    }

    #[test]
    fn bounded_stops_at_limit() {
        let policy = RetryPolicy::Bounded(2);
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
        assert!(!RetryPolicy::Bounded(0).allows(0));
    }

    #[test]
    fn backoff_is_linear() {
        let base = Duration::from_secs(5);
        assert_eq!(linear_backoff(base, 0), Duration::ZERO);
        assert_eq!(linear_backoff(base, 1), Duration::from_secs(5));
        assert_eq!(linear_backoff(base, 4), Duration::from_secs(20));
    }
}
