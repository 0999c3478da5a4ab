// Retry/backoff policy for failed stage attempts
use crate::error::ErrorKind;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-stage retry budget and backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed for one (item, stage), including the first.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            max_backoff,
        }
    }

    /// `attempts` is the number of attempts recorded so far, including the one
    /// that just failed.
    pub fn should_retry(&self, attempts: u32, kind: ErrorKind) -> bool {
        kind == ErrorKind::Retryable && attempts < self.max_retries
    }

    /// Exponential delay without jitter: `base * 2^(attempts-1)`, capped.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Capped exponential delay plus jitter in `[0, base_backoff)`.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let jitter = self.base_backoff.mul_f64(rng.gen::<f64>());
        self.base_delay(attempts) + jitter
    }

    pub fn decide(&self, attempts: u32, kind: ErrorKind) -> RetryDecision {
        if kind == ErrorKind::Fatal {
            return RetryDecision::GiveUp;
        }

        let mut schedule = self.schedule(attempts.saturating_sub(1));
        match backoff::backoff::Backoff::next_backoff(&mut schedule) {
            Some(delay) => RetryDecision::Retry { delay },
            None => RetryDecision::GiveUp,
        }
    }

    /// Backoff schedule for an (item, stage) that already has `attempts`
    /// failures recorded.
    pub fn schedule(&self, attempts: u32) -> RetrySchedule {
        RetrySchedule {
            policy: *self,
            attempts,
        }
    }
}

/// Stateful view of a policy: each `next_backoff` records one more failed
/// attempt and yields the wait before the next one, or `None` once the budget
/// is spent.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetrySchedule {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl backoff::backoff::Backoff for RetrySchedule {
    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts < self.policy.max_retries {
            Some(self.policy.delay_with(self.attempts, &mut rand::thread_rng()))
        } else {
            None
        }
    }
}
