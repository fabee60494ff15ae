//! Rolling-window counters backing the published metrics.
//!
//! Both counters split their window into a fixed number of buckets. Buckets
//! whose start lies before `now - window` are dropped lazily, on the next
//! write or read, so there is no background sweeper.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// Number of buckets a window is split into.
const RESOLUTION: u32 = 20;

/// Trait for any value that can be exposed to a [`MetricSink`](crate::MetricSink).
pub trait Metric: Send + Sync + 'static {
    /// Returns the current value of the metric.
    fn value(&self) -> f64;
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    start: Instant,
    sum: i64,
    hits: i64,
}

type Buckets = SmallVec<[Bucket; 24]>;

#[derive(Debug)]
struct Window {
    buckets: Mutex<Buckets>,
    window_size: Duration,
    bucket_size: Duration,
}

impl Window {
    fn new(window_size: Duration) -> Self {
        let bucket_size = (window_size / RESOLUTION).max(Duration::from_nanos(1));
        Self {
            buckets: Mutex::new(SmallVec::new()),
            window_size,
            bucket_size,
        }
    }

    fn record(&self, value: i64) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        self.evict(&mut buckets, now);

        if let Some(bucket) = buckets.last_mut() {
            if now.duration_since(bucket.start) < self.bucket_size {
                bucket.sum = bucket.sum.saturating_add(value);
                bucket.hits += 1;
                return;
            }
        }

        buckets.push(Bucket {
            start: now,
            sum: value,
            hits: 1,
        });
    }

    /// Returns `(sum, hits)` over the live window.
    fn totals(&self) -> (i64, i64) {
        let mut buckets = self.buckets.lock();
        self.evict(&mut buckets, Instant::now());

        buckets.iter().fold((0i64, 0i64), |(sum, hits), b| {
            (sum.saturating_add(b.sum), hits + b.hits)
        })
    }

    fn evict(&self, buckets: &mut Buckets, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window_size) else {
            return;
        };

        let stale = buckets.iter().take_while(|b| b.start < cutoff).count();
        if stale > 0 {
            buckets.drain(..stale);
        }
    }
}

/// Averages the samples recorded within a trailing window.
///
/// Latency metrics use this with a one minute window and nanosecond samples.
#[derive(Debug)]
pub struct AvgRateCounter {
    window: Window,
}

impl AvgRateCounter {
    /// Creates a counter averaging over `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window: Window::new(window),
        }
    }

    /// Records one sample.
    pub fn incr(&self, value: i64) {
        self.window.record(value);
    }

    /// Average of the samples in the window, or 0 if there are none.
    pub fn average(&self) -> f64 {
        let (sum, hits) = self.window.totals();
        if hits == 0 {
            return 0.0;
        }

        sum as f64 / hits as f64
    }

    /// Number of samples in the window.
    pub fn hits(&self) -> i64 {
        self.window.totals().1
    }

    /// Length of the trailing window.
    pub fn window(&self) -> Duration {
        self.window.window_size
    }
}

impl Metric for AvgRateCounter {
    fn value(&self) -> f64 {
        self.average()
    }
}

/// Counts events within a trailing window.
#[derive(Debug)]
pub struct RateCounter {
    window: Window,
}

impl RateCounter {
    /// Creates a counter over `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window: Window::new(window),
        }
    }

    /// Adds `n` events.
    pub fn incr(&self, n: i64) {
        self.window.record(n);
    }

    /// Sum of the events in the window.
    pub fn rate(&self) -> i64 {
        self.window.totals().0
    }

    /// Length of the trailing window.
    pub fn window(&self) -> Duration {
        self.window.window_size
    }
}

impl Metric for RateCounter {
    fn value(&self) -> f64 {
        self.rate() as f64
    }
}
