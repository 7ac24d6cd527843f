use std::time::Duration;
use tokio::time::Instant;

/// Timestamp guard allowing at most one load-more per rolling window.
///
/// Shared by every trigger source of a controller, so repeated or
/// overlapping signals collapse into a single call.
#[derive(Debug, Clone)]
pub struct LoadMoreGate {
    window: Duration,
    last_fired: Option<Instant>,
}

impl LoadMoreGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: None,
        }
    }

    /// Claim the slot if the window since the last claim has elapsed.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.remaining(now).is_zero() {
            self.last_fired = Some(now);
            true
        } else {
            false
        }
    }

    /// Time until the next claim can succeed.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_fired {
            Some(last) => self.window.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}
