//! Cache observability: lookup and fill latencies plus event counters.
//! Latencies keep a sliding window of the most recent samples per name.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

const WINDOW: usize = 1024;

/// Well-known metric names.
pub mod metric_names {
    pub const LOOKUP: &str = "t_lookup";
    pub const FILL: &str = "t_fill";
    pub const CACHE_HIT: &str = "cache_hit";
    pub const CACHE_MISS: &str = "cache_miss";
    pub const FILL_STARTED: &str = "fill_started";
    pub const FILL_COMPLETED: &str = "fill_completed";
    pub const FILL_FAILED: &str = "fill_failed";
    pub const FILL_SKIPPED_IN_FLIGHT: &str = "fill_skipped_in_flight";
    pub const STORE_UNAVAILABLE: &str = "store_unavailable";
}

/// Records its elapsed time under `name` when stopped.
pub struct LatencyTimer {
    name: &'static str,
    started: Instant,
    registry: Arc<MetricsRegistry>,
}

impl LatencyTimer {
    pub fn stop(self) -> Duration {
        let elapsed = self.started.elapsed();
        self.registry.observe(self.name, elapsed);
        elapsed
    }
}

#[derive(Default)]
struct Window {
    samples_us: VecDeque<u64>,
    total: u64,
}

impl Window {
    fn push(&mut self, us: u64) {
        if self.samples_us.len() == WINDOW {
            self.samples_us.pop_front();
        }
        self.samples_us.push_back(us);
        self.total += 1;
    }

    /// Nearest-rank percentile over the window, `q` in 0..=1.
    fn quantile(sorted: &[u64], q: f64) -> u64 {
        if sorted.is_empty() {
            return 0;
        }
        let rank = (q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank]
    }

    fn summarize(&self) -> LatencySummary {
        let mut sorted: Vec<u64> = self.samples_us.iter().copied().collect();
        sorted.sort_unstable();
        LatencySummary {
            samples: self.total,
            p50_us: Self::quantile(&sorted, 0.50),
            p95_us: Self::quantile(&sorted, 0.95),
            p99_us: Self::quantile(&sorted, 0.99),
            max_us: sorted.last().copied().unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    /// Samples ever observed, not just those in the window.
    pub samples: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub latencies: BTreeMap<String, LatencySummary>,
    pub counters: BTreeMap<String, u64>,
}

#[derive(Default)]
pub struct MetricsRegistry {
    latencies: Mutex<HashMap<&'static str, Window>>,
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, name: &'static str, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.latencies.lock().entry(name).or_default().push(us);
        tracing::trace!(metric = name, us, "latency observed");
    }

    pub fn timer(self: &Arc<Self>, name: &'static str) -> LatencyTimer {
        LatencyTimer {
            name,
            started: Instant::now(),
            registry: Arc::clone(self),
        }
    }

    pub fn increment(&self, name: &'static str) {
        *self.counters.lock().entry(name).or_insert(0) += 1;
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn latency(&self, name: &str) -> Option<LatencySummary> {
        self.latencies.lock().get(name).map(Window::summarize)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latencies = self
            .latencies
            .lock()
            .iter()
            .map(|(name, window)| (name.to_string(), window.summarize()))
            .collect();
        let counters = self
            .counters
            .lock()
            .iter()
            .map(|(name, n)| (name.to_string(), *n))
            .collect();
        MetricsSnapshot {
            latencies,
            counters,
        }
    }
}
