//! Monotonic last-activity tracking shared by the session registry and the
//! connection lifecycle manager.

use std::time::Duration;

use tokio::time::Instant;

/// Last-activity timestamp on tokio's monotonic clock.
///
/// Built on `tokio::time::Instant` so tests can drive it with a paused
/// runtime and `tokio::time::advance`.
#[derive(Debug, Clone, Copy)]
pub struct ActivityClock {
    last_seen: Instant,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(at: Instant) -> Self {
        Self { last_seen: at }
    }

    pub fn touch(&mut self) {
        self.touch_at(Instant::now());
    }

    /// Record activity at `at`. Never moves the timestamp backwards.
    pub fn touch_at(&mut self, at: Instant) {
        if at > self.last_seen {
            self.last_seen = at;
        }
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    /// Strictly longer than `window`; exactly `window` of silence is still live.
    pub fn is_idle(&self, now: Instant, window: Duration) -> bool {
        self.idle_for(now) > window
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}
