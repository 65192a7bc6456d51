//! Bounded exponential backoff for signaling reconnection.

use std::time::Duration;

/// Delay sequence: immediate first attempt, then `base`, doubling up to
/// `cap`. Reset on successful connect.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            next: Duration::ZERO,
        }
    }

    /// Delay to wait before the next attempt, advancing the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = if self.next.is_zero() {
            self.base
        } else {
            (self.next * 2).min(self.cap)
        };
        delay
    }

    pub fn reset(&mut self) {
        self.next = Duration::ZERO;
    }
}
