use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::random::RandomSource;

/// Backoff settings for backend invocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt. `0` means a single attempt.
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
    /// Upper bound of random delay added to each backoff.
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 30_000,
            jitter_ms: 250,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1);
        let factor = self.backoff_factor.max(1).saturating_pow(exp);
        let ms = self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Per-request retry bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryState {
    config: RetryConfig,
    attempts: u32,
}

impl RetryState {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn on_failure(&self, transient: bool, rng: &dyn RandomSource) -> Result<RetryDecision> {
        if !transient || self.retries() >= self.config.max_retries {
            return Ok(RetryDecision::GiveUp);
        }
        let mut delay = self.config.backoff_for(self.attempts);
        if self.config.jitter_ms > 0 {
            let jitter = rng.randint(0, self.config.jitter_ms as i64)?;
            delay += Duration::from_millis(jitter as u64);
        }
        Ok(RetryDecision::RetryAfter(delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::ScriptedRandom;

    fn config() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            backoff_ms: 100,
            backoff_factor: 2,
            max_backoff_ms: 250,
            jitter_ms: 0,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let c = config();
        assert_eq!(c.backoff_for(1), Duration::from_millis(100));
        assert_eq!(c.backoff_for(2), Duration::from_millis(200));
        assert_eq!(c.backoff_for(3), Duration::from_millis(250));
    }

    #[test]
    fn test_transient_failures_until_budget_spent() {
        let rng = ScriptedRandom::zeros();
        let mut state = RetryState::new(config());

        state.begin_attempt();
        assert_eq!(
            state.on_failure(true, &rng).unwrap(),
            RetryDecision::RetryAfter(Duration::from_millis(100))
        );
        state.begin_attempt();
        assert_eq!(
            state.on_failure(true, &rng).unwrap(),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
        state.begin_attempt();
        assert_eq!(state.on_failure(true, &rng).unwrap(), RetryDecision::GiveUp);
        assert_eq!(state.attempts(), 3);
        assert_eq!(state.retries(), 2);
    }

    #[test]
    fn test_permanent_failure_gives_up_immediately() {
        let rng = ScriptedRandom::zeros();
        let mut state = RetryState::new(config());
        state.begin_attempt();
        assert_eq!(state.on_failure(false, &rng).unwrap(), RetryDecision::GiveUp);
    }

    #[test]
    fn test_jitter_added() {
        let rng = ScriptedRandom::new([40], []);
        let mut state = RetryState::new(RetryConfig {
            jitter_ms: 50,
            ..config()
        });
        state.begin_attempt();
        assert_eq!(
            state.on_failure(true, &rng).unwrap(),
            RetryDecision::RetryAfter(Duration::from_millis(140))
        );
    }
}
