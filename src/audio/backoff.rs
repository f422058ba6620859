//! Blocking sleeps used by the I/O paths: pacing and failure backoff.

use std::thread;
use std::time::Duration;

use super::pcm::frames_to_duration;

/// Clock seam for every sleep issued by the endpoints.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

/// Rate limit applied after a failed read or write: the caller is held for
/// the nominal duration of the frames it asked to transfer, so a dead port
/// does not spin the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub enabled: bool,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl RetryBackoff {
    pub fn delay_for(&self, frames: usize, rate: u32) -> Duration {
        if self.enabled {
            frames_to_duration(frames, rate)
        } else {
            Duration::ZERO
        }
    }

    pub fn after_failure(&self, sleeper: &dyn Sleeper, frames: usize, rate: u32) {
        let delay = self.delay_for(frames, rate);
        if !delay.is_zero() {
            sleeper.sleep(delay);
        }
    }
}
