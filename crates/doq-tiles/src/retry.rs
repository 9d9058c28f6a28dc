//! Retry policy and the sleeping it does between attempts.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{FetchError, TileError};

/// Something that can pause the current thread.
pub trait Sleeper: Send {
    fn sleep(&mut self, duration: Duration);
}

/// Sleeps on the real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested pauses without sleeping. Clones share one log.
#[derive(Debug, Default, Clone)]
pub struct RecordingSleeper {
    naps: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pauses requested so far.
    pub fn naps(&self) -> Vec<Duration> {
        self.naps.lock().clone()
    }

    /// Sum of all requested pauses.
    pub fn total(&self) -> Duration {
        self.naps.lock().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&mut self, duration: Duration) {
        self.naps.lock().push(duration);
    }
}

/// Bounded retry with a fixed pause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up; at least one attempt is always made.
    pub max_attempts: u32,
    /// Pause after an ordinary failure.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1000,
            delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// How long to wait after `err` before the next attempt.
    ///
    /// A backend that reports a cooldown is waited out; anything else gets
    /// the fixed delay.
    pub fn delay_after(&self, err: &TileError) -> Duration {
        match err {
            TileError::Fetch(FetchError::CoolingDown { remaining }) => *remaining,
            _ => self.delay,
        }
    }

    /// Attempts actually made.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}
