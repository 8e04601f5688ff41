// Thread-safe windowed latency samples and throughput counters.
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

// Trailing samples kept when an insertion crosses the window end.
const MAX_SAMPLES: usize = 1000;

/// Snapshot returned by [`Metrics::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
    pub processed: u64,
    pub dropped: u64,
    pub msgs_per_second: f64,
    pub queue_depth: usize,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "p50={} p90={} p99={} msgs/sec={:.2} processed={} dropped={} queue_depth={}",
            format_duration(self.p50),
            format_duration(self.p90),
            format_duration(self.p99),
            self.msgs_per_second,
            self.processed,
            self.dropped,
            self.queue_depth,
        )
    }
}

struct SampleWindow {
    samples: Vec<u64>,
    window_start: Instant,
}

struct RateAnchor {
    last_calc: Instant,
    last_count: u64,
}

/// Latency and throughput collector shared between the subscriber's I/O
/// thread and its workers.
///
/// Counters are relaxed atomics; the sample buffer sits behind one mutex and
/// is bounded by an approximate sliding window: any insertion past the
/// window end trims the buffer to the trailing 1000 samples and restarts the
/// window at now.
pub struct Metrics {
    window: Duration,
    samples: Mutex<SampleWindow>,
    processed: AtomicU64,
    dropped: AtomicU64,
    queue_depth: AtomicUsize,
    rate: Mutex<RateAnchor>,
}

impl Metrics {
    pub fn new(window: Duration) -> Self {
        let now = Instant::now();
        Self {
            window,
            samples: Mutex::new(SampleWindow {
                samples: Vec::new(),
                window_start: now,
            }),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            rate: Mutex::new(RateAnchor {
                last_calc: now,
                last_count: 0,
            }),
        }
    }

    pub fn record_latency(&self, latency: Duration) {
        let mut window = self.samples.lock().expect("samples lock");
        window.samples.push(latency.as_nanos() as u64);

        let now = Instant::now();
        if now > window.window_start + self.window {
            let len = window.samples.len();
            if len > MAX_SAMPLES {
                window.samples.drain(..len - MAX_SAMPLES);
            }
            window.window_start = now;
        }
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    /// Compute a snapshot. The message rate is measured between consecutive
    /// `stats` calls; a call landing in the same millisecond as the previous
    /// one reports 0.0 and leaves the rate anchor untouched.
    pub fn stats(&self) -> Stats {
        let now = Instant::now();
        let current = self.processed.load(Ordering::Relaxed);

        let mut msgs_per_second = 0.0;
        {
            let mut anchor = self.rate.lock().expect("rate lock");
            let elapsed_ms = now.duration_since(anchor.last_calc).as_millis();
            if elapsed_ms > 0 {
                msgs_per_second =
                    current.saturating_sub(anchor.last_count) as f64 * 1000.0 / elapsed_ms as f64;
                anchor.last_count = current;
                anchor.last_calc = now;
            }
        }

        let (p50, p90, p99) = {
            let window = self.samples.lock().expect("samples lock");
            if window.samples.is_empty() {
                (Duration::ZERO, Duration::ZERO, Duration::ZERO)
            } else {
                let mut sorted = window.samples.clone();
                sorted.sort_unstable();
                (
                    duration_from_ns(percentile(&sorted, 50.0)),
                    duration_from_ns(percentile(&sorted, 90.0)),
                    duration_from_ns(percentile(&sorted, 99.0)),
                )
            }
        };

        Stats {
            p50,
            p90,
            p99,
            processed: current,
            dropped: self.dropped.load(Ordering::Relaxed),
            msgs_per_second,
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
        }
    }

    /// Zero all state and restart the window and rate anchor.
    pub fn reset(&self) {
        let now = Instant::now();
        {
            let mut window = self.samples.lock().expect("samples lock");
            window.samples.clear();
            window.window_start = now;
        }
        self.processed.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.queue_depth.store(0, Ordering::Relaxed);
        let mut anchor = self.rate.lock().expect("rate lock");
        anchor.last_calc = now;
        anchor.last_count = 0;
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_METRICS_PERIOD)
    }
}

// Linear interpolation between the two nearest ranks.
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = idx.floor() as usize;
    let upper = idx.ceil() as usize;
    if lower == upper {
        return sorted[lower] as f64;
    }
    let weight = idx - lower as f64;
    sorted[lower] as f64 * (1.0 - weight) + sorted[upper] as f64 * weight
}

fn duration_from_ns(ns: f64) -> Duration {
    Duration::from_nanos(ns.round() as u64)
}

/// Render a duration with a unit matching its magnitude.
pub fn format_duration(duration: Duration) -> String {
    let ns = duration.as_nanos();
    if ns < 1_000 {
        format!("{ns}ns")
    } else if ns < 1_000_000 {
        format!("{}us", ns / 1_000)
    } else if ns < 1_000_000_000 {
        format!("{}ms", ns / 1_000_000)
    } else {
        format!("{}s", ns / 1_000_000_000)
    }
}
