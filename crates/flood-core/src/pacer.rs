use std::sync::Arc;
use std::time::Duration;

use crate::stats::Controller;

/// How long a worker may aggregate locally before pushing an activity
/// window to the controller.
const FLUSH_AFTER: Duration = Duration::from_millis(100);

/// Floor for a worker's rate share, so a zero share ticks very slowly
/// instead of producing an unrepresentable interval.
const MIN_RATE: f64 = 1.0 / 3600.0;

#[derive(Debug, Clone, Copy, Default)]
struct Activity {
    count: i64,
    seconds: f64,
}

/// Per-worker rate governor. Tracks requests in flight against the worker's
/// session count and stretches the inter-request gap linearly once the
/// backlog exceeds it. All time sums are kept relative to `base`, which
/// keeps the awaiting integral non-negative.
///
/// Single-threaded: both operations are called from the owning driver only.
pub struct Pacer {
    controller: Arc<Controller>,
    watermark: Duration,
    rate: f64,
    threshold: i64,
    base: Duration,
    pending: Activity,
    previous: Activity,
    done: Activity,
}

impl Pacer {
    pub fn new(
        controller: Arc<Controller>,
        watermark: Duration,
        rate: f64,
        threshold: usize,
        base: Duration,
    ) -> Self {
        Self {
            controller,
            watermark,
            rate: rate.max(MIN_RATE),
            threshold: threshold as i64,
            base,
            pending: Activity::default(),
            previous: Activity::default(),
            done: Activity::default(),
        }
    }

    /// Account one submitted request and return the delay before the next
    /// one. At most one outstanding request per session on average keeps the
    /// base interval; past that the gap grows with the excess.
    pub fn initiated(&mut self, now: Duration) -> Duration {
        let mut interval = 1.0 / self.rate;
        self.pending.count += 1;
        self.pending.seconds += (now - self.base).as_secs_f64();
        if self.pending.count > self.threshold {
            interval += interval * self.pending.count as f64 / self.threshold as f64;
        }
        Duration::from_secs_f64(interval)
    }

    /// Account one completed request; every 100 ms of wall time, push the
    /// accumulated window to the controller.
    pub fn completed(&mut self, now: Duration, elapsed: Duration) {
        let since_base = now - self.base;
        self.pending.count -= 1;
        self.pending.seconds -= (since_base - elapsed).as_secs_f64();
        self.done.count += 1;
        self.done.seconds += elapsed.as_secs_f64();

        if now - self.watermark >= FLUSH_AFTER {
            // Area under the in-flight curve since base, minus the snapshot
            // taken at the previous flush: the awaiting time of this window.
            let awaiting = self.pending.count as f64 * since_base.as_secs_f64() - self.pending.seconds;
            self.controller.update(
                self.watermark,
                now,
                self.done.count as u64,
                self.done.seconds,
                self.pending.count - self.previous.count,
                awaiting - self.previous.seconds,
            );
            self.done = Activity::default();
            self.previous = Activity {
                count: self.pending.count,
                seconds: awaiting,
            };
            self.watermark = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn pacer(rate: f64, threshold: usize) -> Pacer {
        let base = secs(100.0);
        let controller = Arc::new(Controller::new(1, base));
        Pacer::new(controller, base, rate, threshold, base)
    }

    #[test]
    fn base_interval_while_under_threshold() {
        let mut pacer = pacer(100.0, 2);
        assert_eq!(pacer.initiated(secs(100.0)), secs(0.01));
        assert_eq!(pacer.initiated(secs(100.0)), secs(0.01));
    }

    #[test]
    fn backlog_stretches_the_interval() {
        let mut pacer = pacer(100.0, 2);
        let now = secs(100.0);
        pacer.initiated(now);
        pacer.initiated(now);
        // third in flight: 0.01 * (1 + 3/2)
        assert_eq!(pacer.initiated(now), secs(0.025));
        assert_eq!(pacer.initiated(now), secs(0.03));
        // fifth in flight against a threshold of two: 3.5x the base gap
        assert_eq!(pacer.initiated(now), secs(0.035));
    }

    #[test]
    fn intervals_are_monotonic_in_the_backlog() {
        let mut pacer = pacer(250.0, 4);
        let now = secs(100.0);
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let interval = pacer.initiated(now);
            assert!(interval >= last);
            last = interval;
        }
    }

    #[test]
    fn completion_restores_the_base_interval() {
        let mut pacer = pacer(100.0, 1);
        let now = secs(100.0);
        pacer.initiated(now);
        pacer.initiated(now);
        assert!(pacer.initiated(now) > secs(0.01));
        // Bring the backlog back under the threshold; stay within the flush
        // window so only the bookkeeping changes.
        pacer.completed(secs(100.01), secs(0.01));
        pacer.completed(secs(100.02), secs(0.02));
        pacer.completed(secs(100.03), secs(0.03));
        assert_eq!(pacer.pending.count, 0);
        assert_eq!(pacer.initiated(secs(100.03)), secs(0.01));
    }

    #[test]
    fn pending_sums_track_inflight_start_offsets() {
        let mut pacer = pacer(10.0, 8);
        pacer.initiated(secs(100.0));
        pacer.initiated(secs(101.0));
        pacer.initiated(secs(102.0));
        assert_eq!(pacer.pending.count, 3);
        assert!((pacer.pending.seconds - 3.0).abs() < 1e-9);

        // Completing the request submitted at 100 s removes its offset.
        pacer.completed(secs(102.05), secs(2.05));
        assert_eq!(pacer.pending.count, 2);
        assert!((pacer.pending.seconds - 3.0).abs() < 1e-9);

        // Completing the one submitted at 102 s removes offset 2.
        pacer.completed(secs(102.09), secs(0.09));
        assert_eq!(pacer.pending.count, 1);
        assert!((pacer.pending.seconds - 1.0).abs() < 1e-9);
    }

    #[test]
    fn flush_resets_the_window_and_advances_the_watermark() {
        let mut pacer = pacer(10.0, 8);
        pacer.initiated(secs(100.0));
        pacer.initiated(secs(100.0));
        pacer.completed(secs(100.05), secs(0.05));
        // Under 100 ms since the watermark: window keeps accumulating.
        assert_eq!(pacer.done.count, 1);
        assert_eq!(pacer.watermark, secs(100.0));

        pacer.completed(secs(100.2), secs(0.2));
        assert_eq!(pacer.done.count, 0);
        assert_eq!(pacer.watermark, secs(100.2));
        assert_eq!(pacer.previous.count, 0);
        assert!(pacer.previous.seconds.abs() < 1e-9);
    }

    #[test]
    fn zero_rate_share_still_yields_a_finite_interval() {
        let mut pacer = pacer(0.0, 1);
        let interval = pacer.initiated(secs(100.0));
        assert!(interval <= secs(3600.0));
    }
}
