//! Bounded retry state machine
//!
//! Submission and completion both retry transient errnos a bounded number
//! of times. The bound and the pause between attempts are data, so the same
//! loop serves tight spinning, yielding and sleeping.

use serde::Serialize;
use std::time::Duration;

/// How to pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Spin hint only.
    Spin,
    /// `std::thread::yield_now`.
    Yield,
    /// `sched_yield(2)`.
    SchedYield,
    /// Sleep for a fixed time.
    Sleep(Duration),
    /// Return immediately.
    #[default]
    None,
}

impl Backoff {
    /// Pause once.
    #[inline]
    pub fn pause(self) {
        match self {
            Self::Spin => std::hint::spin_loop(),
            Self::Yield => std::thread::yield_now(),
            Self::SchedYield => {
                let _ = nix::sched::sched_yield();
            }
            Self::Sleep(d) => std::thread::sleep(d),
            Self::None => {}
        }
    }
}

/// Attempt ceiling plus pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Policy with `max_attempts` retries and no pause.
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::None,
        }
    }

    /// Same ceiling, different pause.
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Start counting attempts.
    pub fn start(&self) -> Retry {
        Retry {
            policy: *self,
            attempts: 0,
        }
    }
}

/// Result of recording one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Try again; the pause has already happened.
    Again,
    /// The ceiling was reached.
    Exhausted,
}

/// Running attempt counter for one operation.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    policy: RetryPolicy,
    attempts: u32,
}

impl Retry {
    /// Record a failed attempt, pausing if another is allowed.
    pub fn step(&mut self) -> RetryStep {
        if self.attempts >= self.policy.max_attempts {
            return RetryStep::Exhausted;
        }
        self.attempts += 1;
        self.policy.backoff.pause();
        RetryStep::Again
    }

    /// Retries taken so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_retry_exhausts_after_ceiling() {
        let mut retry = RetryPolicy::new(3).start();
        assert_eq!(retry.step(), RetryStep::Again);
        assert_eq!(retry.step(), RetryStep::Again);
        assert_eq!(retry.step(), RetryStep::Again);
        assert_eq!(retry.step(), RetryStep::Exhausted);
        assert_eq!(retry.attempts(), 3);
    }

    #[test]
    fn test_zero_ceiling_never_retries() {
        let mut retry = RetryPolicy::new(0).start();
        assert_eq!(retry.step(), RetryStep::Exhausted);
        assert_eq!(retry.attempts(), 0);
    }

    #[test]
    fn test_sleep_backoff_pauses() {
        let policy = RetryPolicy::new(2).with_backoff(Backoff::Sleep(Duration::from_millis(2)));
        let mut retry = policy.start();
        let start = Instant::now();
        retry.step();
        retry.step();
        assert!(start.elapsed() >= Duration::from_millis(4));
    }

    #[test]
    fn test_all_backoffs_return() {
        for b in [
            Backoff::Spin,
            Backoff::Yield,
            Backoff::SchedYield,
            Backoff::Sleep(Duration::from_micros(1)),
            Backoff::None,
        ] {
            b.pause();
        }
    }
}
