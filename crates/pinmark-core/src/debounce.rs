//! Trailing-edge debounce driven by explicit instants.

use std::time::{Duration, Instant};

/// Longest wait used when `now + delay` is not representable.
const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// `now + delay`, clamped to what `Instant` can hold.
pub(crate) fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(MAX_WAIT))
        .unwrap_or(now)
}

/// Fires once after `delay` has passed without another trigger.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Restart the window at `now`.
    pub fn trigger(&mut self, now: Instant) {
        self.deadline = Some(deadline_after(now, self.delay));
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Returns true exactly once when the window has elapsed.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
