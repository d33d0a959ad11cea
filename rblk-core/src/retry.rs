//! Bounded retry with injectable pauses.
//!
//! Every suspension point in the engine (ring full, in-flight cap reached,
//! empty completion channel) goes through a [`Backoff`] so that waiting is
//! always bounded and tests can observe it without real sleeps.

use crate::{RblkError, Result};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// How a suspended worker waits.
pub trait Pause: Send + Sync {
    fn pause(&self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleep;

impl Pause for ThreadSleep {
    #[inline]
    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested pauses without sleeping.
#[derive(Debug, Default)]
pub struct CountingPause {
    calls: AtomicU64,
    total: Mutex<Duration>,
}

impl CountingPause {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total(&self) -> Duration {
        self.total.lock().map(|d| *d).unwrap_or_default()
    }
}

impl Pause for CountingPause {
    fn pause(&self, duration: Duration) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut total) = self.total.lock() {
            *total += duration;
        }
        std::thread::yield_now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Waits allowed before giving up; `u32::MAX` never gives up.
    pub max_attempts: u32,
    /// Sleep between attempts once spinning is over.
    pub backoff: Duration,
    /// Leading attempts that only spin instead of sleeping.
    pub spin_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10_000,
            backoff: Duration::from_micros(10),
            spin_attempts: 0,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            spin_attempts: 0,
        }
    }

    /// Policy that never exhausts, for loops whose idle state is normal.
    #[must_use]
    pub fn unbounded(backoff: Duration) -> Self {
        Self::new(u32::MAX, backoff)
    }

    #[must_use]
    pub fn with_spin(mut self, spin_attempts: u32) -> Self {
        self.spin_attempts = spin_attempts;
        self
    }

    #[must_use]
    pub fn backoff<'a>(&'a self, pause: &'a dyn Pause) -> Backoff<'a> {
        Backoff {
            policy: self,
            pause,
            attempts: 0,
        }
    }
}

/// Per-operation retry state.
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    pause: &'a dyn Pause,
    attempts: u32,
}

impl Backoff<'_> {
    /// Wait once before the next attempt.
    ///
    /// # Errors
    /// Returns `RetryExhausted` once `max_attempts` waits have been spent.
    pub fn wait(&mut self) -> Result<()> {
        if self.attempts >= self.policy.max_attempts {
            return Err(RblkError::RetryExhausted {
                attempts: self.attempts,
            });
        }
        self.attempts += 1;
        if self.attempts <= self.policy.spin_attempts {
            std::hint::spin_loop();
        } else {
            self.pause.pause(self.policy.backoff);
        }
        Ok(())
    }

    #[inline]
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    #[inline]
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
