use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Wall clock with a monotonic backbone. The epoch offset is sampled once at
/// construction so that timestamps are comparable across worker threads and
/// never go backwards if the system clock steps mid-run.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    epoch: Duration,
    origin: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            epoch: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default(),
            origin: Instant::now(),
        }
    }

    /// Current wall time as a duration since the Unix epoch.
    pub fn now(&self) -> Duration {
        self.epoch + self.origin.elapsed()
    }

    /// Monotonic instant corresponding to a wall timestamp, for timer arming.
    /// Timestamps before the clock's origin clamp to the origin.
    pub fn instant_at(&self, wall: Duration) -> Instant {
        self.origin + wall.saturating_sub(self.epoch)
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}
