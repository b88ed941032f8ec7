use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const MB: f64 = 1024.0 * 1024.0;

/// Per-thread readout counter with all-time totals and a sliding-window rate.
///
/// Only the owning thread touches it; the numbers are for display.
#[derive(Debug, Clone)]
pub struct Counter {
    pub total_size: usize,
    pub n_events: usize,
    pub t_begin: Instant,
    window: Duration,
    recent: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Self::with_window(Duration::from_secs(1))
    }
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            total_size: 0,
            n_events: 0,
            t_begin: Instant::now(),
            window,
            recent: VecDeque::new(),
            bytes_in_window: 0,
        }
    }

    /// Account one event of `size` bytes.
    pub fn increment(&mut self, size: usize) {
        let now = Instant::now();
        self.total_size += size;
        self.n_events += 1;
        self.recent.push_back((now, size));
        self.bytes_in_window += size;
        self.expire(now);
    }

    /// MB/s since creation or the last reset.
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.total_size as f64 / secs / MB
    }

    /// MB/s over the sliding window ending now.
    pub fn rate(&self) -> f64 {
        let now = Instant::now();
        let stale: usize = self
            .recent
            .iter()
            .take_while(|(t, _)| now.duration_since(*t) > self.window)
            .map(|&(_, size)| size)
            .sum();
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window - stale) as f64 / secs / MB
    }

    pub fn reset(&mut self) {
        self.total_size = 0;
        self.n_events = 0;
        self.t_begin = Instant::now();
        self.recent.clear();
        self.bytes_in_window = 0;
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(t, size)) = self.recent.front() {
            if now.duration_since(t) <= self.window {
                break;
            }
            self.recent.pop_front();
            self.bytes_in_window -= size;
        }
    }
}

/// Queue-to-finalize delay of events leaving the correlation window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl LatencyStats {
    pub fn record(&mut self, latency: Duration) {
        self.count += 1;
        self.total += latency;
        self.max = self.max.max(latency);
    }

    pub fn mean(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total / n,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }
}

/// Totals a board thread publishes for the orchestrator. Relaxed ordering:
/// values are approximate while the run is live and exact after the join.
#[derive(Debug, Default)]
pub struct WorkerStats {
    events: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
    read_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub events: u64,
    pub bytes: u64,
    pub dropped: u64,
    pub read_errors: u64,
}

impl WorkerStats {
    pub fn record_event(&self, size: usize) {
        self.events.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            events: self.events.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}
