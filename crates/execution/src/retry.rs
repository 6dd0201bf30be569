use fx_engine_core::config::ExecutionConfig;
use std::time::Duration;

/// Exponential backoff for transient broker errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_execution(&ExecutionConfig::default())
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_execution(config: &ExecutionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_backoff(),
            max_delay: config.max_backoff(),
        }
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the next attempt given the previous delay.
    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        (delay * 2).min(self.max_delay)
    }

    /// Delays slept between attempts, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.base_delay.min(self.max_delay)), |d| {
            Some(self.next_delay(*d))
        })
        .take(self.max_retries as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped() {
        let policy = RetryPolicy {
            max_retries: 6,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        };
        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 2000, 2000]);
        assert_eq!(policy.max_attempts(), 7);
    }

    #[test]
    fn zero_retries_never_sleeps() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delays().count(), 0);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn built_from_execution_settings() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_millis(4000));
    }
}
