// Reconnect backoff for the client connection manager.
//
// Pure state: no clocks, no sleeping. The connection driver asks for the next
// delay after each failed attempt and resets after each successful open.
// Delay for attempt n (0-based) is `min(base * 2^n, max_delay)`. With
// `max_retries` set, `next_delay` returns `None` once that many delays have
// been handed out and the driver gives up.

use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Backoff {
            config,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt, or `None` when retries are
    /// exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self
            .config
            .max_retries
            .is_some_and(|max| self.attempts >= max)
        {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        let delay = self.config.base.saturating_mul(factor).min(self.config.max_delay);
        self.attempts = self.attempts.saturating_add(1);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.config
            .max_retries
            .is_some_and(|max| self.attempts >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn doubles_until_capped() {
        let mut backoff = Backoff::new(BackoffConfig {
            base: ms(100),
            max_delay: ms(1000),
            max_retries: None,
        });
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay().unwrap()).collect();
        assert_eq!(delays, vec![ms(100), ms(200), ms(400), ms(800), ms(1000), ms(1000)]);
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn gives_up_after_max_retries() {
        let mut backoff = Backoff::new(BackoffConfig {
            max_retries: Some(2),
            ..BackoffConfig::default()
        });
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.is_exhausted());
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn huge_attempt_counts_stay_capped() {
        let mut backoff = Backoff::new(BackoffConfig::default());
        for _ in 0..100 {
            assert!(backoff.next_delay().unwrap() <= Duration::from_secs(30));
        }
    }
}
