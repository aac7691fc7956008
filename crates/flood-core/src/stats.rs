use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Report cadence. Boundaries are aligned to multiples of this interval
/// since the Unix epoch, across all workers.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// One slice of the timeline. `contributors` counts the workers whose
/// activity windows have covered the slice; `completed` and `latency` hold
/// the time-apportioned shares of those windows. `latency` is in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Bucket {
    contributors: usize,
    completed: f64,
    latency: f64,
}

impl Bucket {
    /// Take the `ratio` share, leaving the rest behind. The contributor
    /// count is copied to both sides: it tracks which workers have posted
    /// activity over the slice, not a divisible measurement.
    fn split(&mut self, ratio: f64) -> Bucket {
        let head = Bucket {
            contributors: self.contributors,
            completed: self.completed * ratio,
            latency: self.latency * ratio,
        };
        self.completed -= head.completed;
        self.latency -= head.latency;
        head
    }

    fn add(&mut self, other: Bucket) {
        self.contributors += other.contributors;
        self.completed += other.completed;
        self.latency += other.latency;
    }
}

/// One finished reporting interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Boundary just crossed; always a multiple of the report interval.
    pub timestamp: u64,
    pub rps: u64,
    pub avg_latency_us: u64,
    pub in_flight: u64,
    pub avg_awaiting_us: u64,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "STATUS: {} {} {} {} {}",
            self.timestamp, self.rps, self.avg_latency_us, self.in_flight, self.avg_awaiting_us
        )
    }
}

struct State {
    workers: usize,
    emit_at: Duration,
    buckets: BTreeMap<Duration, Bucket>,
    /// Pending-emit accumulator for the interval ending at `emit_at`.
    report: Bucket,
    /// Running in-flight snapshot: sum of the workers' last reported pending
    /// counts and awaiting integrals. Not time-bucketed.
    current: Bucket,
}

impl State {
    fn new(workers: usize, start: Duration) -> Self {
        let mut buckets = BTreeMap::new();
        buckets.insert(start, Bucket::default());
        let interval = REPORT_INTERVAL.as_nanos();
        let emit_at = start + REPORT_INTERVAL
            - Duration::from_nanos((start.as_nanos() % interval) as u64);
        Self {
            workers,
            emit_at,
            buckets,
            report: Bucket::default(),
            current: Bucket::default(),
        }
    }

    fn update(
        &mut self,
        from: Duration,
        to: Duration,
        completed: u64,
        latency: f64,
        pending_delta: i64,
        awaiting_delta: f64,
    ) -> Vec<Report> {
        debug_assert!(to > from);
        self.put(from);
        self.put(to);

        // Apportion this worker window over every bucket it covers, by the
        // share of the window each bucket spans.
        let total = (to - from).as_secs_f64();
        let keys: Vec<Duration> = self.buckets.range(from..=to).map(|(&k, _)| k).collect();
        for pair in keys.windows(2) {
            let ratio = (pair[1] - pair[0]).as_secs_f64() / total;
            let bucket = self.buckets.get_mut(&pair[1]).expect("anchored bucket");
            bucket.add(Bucket {
                contributors: 1,
                completed: completed as f64 * ratio,
                latency: latency * ratio,
            });
        }

        self.current.completed += pending_delta as f64;
        self.current.latency += awaiting_delta;

        self.drain()
    }

    /// Ensure a bucket boundary exists at `at`, splitting the enclosing
    /// bucket proportionally when `at` falls strictly inside one.
    fn put(&mut self, at: Duration) {
        if self.buckets.contains_key(&at) {
            return;
        }
        let Some((&next, _)) = self.buckets.range(at..).next() else {
            self.buckets.insert(at, Bucket::default());
            return;
        };
        let (&prev, _) = self
            .buckets
            .range(..at)
            .next_back()
            .expect("bucket map lost its origin");
        let ratio = (at - prev).as_secs_f64() / (next - prev).as_secs_f64();
        let head = self
            .buckets
            .get_mut(&next)
            .expect("anchored bucket")
            .split(ratio);
        self.buckets.insert(at, head);
    }

    /// Retire fully-contributed buckets from the front of the timeline. The
    /// front entry is the origin marker; its successor's value covers the
    /// slice between them and is consumed once every worker has posted it.
    fn drain(&mut self) -> Vec<Report> {
        let mut out = Vec::new();
        loop {
            let mut pair = self.buckets.iter();
            let (Some((&front, _)), Some((&next, &bucket))) = (pair.next(), pair.next()) else {
                break;
            };
            if bucket.contributors != self.workers {
                break;
            }
            self.finish(front, next, bucket, &mut out);
            self.buckets.remove(&front);
        }
        out
    }

    /// Fold a finished slice into the report accumulator, emitting a report
    /// for every aligned boundary the slice crosses, apportioned by time.
    fn finish(&mut self, mut from: Duration, to: Duration, mut value: Bucket, out: &mut Vec<Report>) {
        while to >= self.emit_at {
            let boundary = self.emit_at;
            let ratio = (boundary - from).as_secs_f64() / (to - from).as_secs_f64();
            self.report.add(value.split(ratio));
            out.push(self.snapshot(boundary));
            self.report = Bucket::default();
            from = boundary;
            self.emit_at = boundary + REPORT_INTERVAL;
        }
        self.report.add(value);
    }

    fn snapshot(&self, boundary: Duration) -> Report {
        let interval = REPORT_INTERVAL.as_secs_f64();
        Report {
            timestamp: boundary.as_secs(),
            rps: (self.report.completed / interval) as u64,
            avg_latency_us: (self.report.latency / (self.report.completed + 1.0) * 1e6) as u64,
            in_flight: self.current.completed as u64,
            avg_awaiting_us: (self.current.latency / (self.current.completed + 1.0) * 1e6) as u64,
        }
    }
}

/// Process-wide aggregator, shared by every worker through an `Arc`. Workers
/// post activity windows at least 100 ms apart, so the mutex stays off the
/// per-request hot path. Reports print to stdout as they complete.
pub struct Controller {
    state: Mutex<State>,
}

impl Controller {
    pub fn new(workers: usize, start: Duration) -> Self {
        Self {
            state: Mutex::new(State::new(workers, start)),
        }
    }

    /// Fold one worker window [from, to] into the timeline. `completed` and
    /// `latency` describe requests finished inside the window; the deltas
    /// adjust the process-wide in-flight snapshot.
    pub fn update(
        &self,
        from: Duration,
        to: Duration,
        completed: u64,
        latency: f64,
        pending_delta: i64,
        awaiting_delta: f64,
    ) {
        let mut state = self.state.lock().expect("controller mutex poisoned");
        // Printing stays under the lock so report lines come out in
        // boundary order even when two workers drain back to back.
        for report in state.update(from, to, completed, latency, pending_delta, awaiting_delta) {
            println!("{report}");
        }
    }
}
