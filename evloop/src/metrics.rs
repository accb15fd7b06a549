//! Rolling-window counters and latency sampling.
//!
//! A contract, not a histogram library: counters are plain monotonic
//! `AtomicU64`s, and tick-latency is tracked via a fixed-capacity
//! most-recent-N ring rather than a proper reservoir sample — `evloop`'s
//! dependency stack has no `rand` crate, and percentiles over "whatever
//! ticks happened most recently" are a perfectly serviceable approximation
//! for the operator-facing numbers this module exists to produce.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const LATENCY_SAMPLE_CAPACITY: usize = 1024;

/// Point-in-time snapshot of [`Metrics`], cheap to clone and log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    /// Total ticks completed.
    pub ticks: u64,
    /// Total ingress tasks executed.
    pub tasks_executed: u64,
    /// Total microtasks executed.
    pub microtasks_executed: u64,
    /// Total timer callbacks fired.
    pub timers_fired: u64,
    /// Median tick latency, or `None` if no samples have been recorded.
    pub p50_tick_latency: Option<Duration>,
    /// 90th percentile tick latency.
    pub p90_tick_latency: Option<Duration>,
    /// 99th percentile tick latency.
    pub p99_tick_latency: Option<Duration>,
}

/// Rolling-window tick/task counters plus a bounded tick-latency sample.
///
/// Disabled entirely via [`crate::options::LoopOptionsBuilder::metrics_enabled`]
/// for callers who want to avoid even the (small) per-tick atomic-increment
/// cost; every recording method becomes a no-op when disabled.
#[derive(Debug)]
pub struct Metrics {
    enabled: AtomicBool,
    ticks: AtomicU64,
    tasks_executed: AtomicU64,
    microtasks_executed: AtomicU64,
    timers_fired: AtomicU64,
    latency_samples: Mutex<Vec<Duration>>,
    sample_cursor: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Metrics {
    /// Creates a fresh, zeroed metrics collector.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            ticks: AtomicU64::new(0),
            tasks_executed: AtomicU64::new(0),
            microtasks_executed: AtomicU64::new(0),
            timers_fired: AtomicU64::new(0),
            latency_samples: Mutex::new(Vec::with_capacity(LATENCY_SAMPLE_CAPACITY)),
            sample_cursor: AtomicU64::new(0),
        }
    }

    #[must_use]
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Records one completed tick and its wall-clock latency.
    pub fn record_tick(&self, latency: Duration) {
        if !self.is_enabled() {
            return;
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.sample_latency(latency);
    }

    /// Records one ingress task execution.
    pub fn record_task(&self) {
        if self.is_enabled() {
            self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records one microtask execution.
    pub fn record_microtask(&self) {
        if self.is_enabled() {
            self.microtasks_executed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records one timer callback firing.
    pub fn record_timer(&self) {
        if self.is_enabled() {
            self.timers_fired.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn sample_latency(&self, latency: Duration) {
        let mut samples = self
            .latency_samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if samples.len() < LATENCY_SAMPLE_CAPACITY {
            samples.push(latency);
        } else {
            // Fixed-size circular overwrite: keeps the most recent
            // LATENCY_SAMPLE_CAPACITY ticks rather than the first ones ever
            // seen, which is the window an operator actually cares about.
            let cursor = self.sample_cursor.fetch_add(1, Ordering::Relaxed) as usize;
            samples[cursor % LATENCY_SAMPLE_CAPACITY] = latency;
        }
    }

    fn percentile(&self, p: f64) -> Option<Duration> {
        let samples = self
            .latency_samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted.get(idx.min(sorted.len() - 1)).copied()
    }

    /// Takes a consistent snapshot of every counter and percentile.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            microtasks_executed: self.microtasks_executed.load(Ordering::Relaxed),
            timers_fired: self.timers_fired.load(Ordering::Relaxed),
            p50_tick_latency: self.percentile(0.50),
            p90_tick_latency: self.percentile(0.90),
            p99_tick_latency: self.percentile(0.99),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_metrics_stay_zero() {
        let m = Metrics::new(false);
        m.record_tick(Duration::from_millis(1));
        m.record_task();
        let snap = m.snapshot();
        assert_eq!(snap.ticks, 0);
        assert_eq!(snap.tasks_executed, 0);
        assert!(snap.p50_tick_latency.is_none());
    }

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new(true);
        m.record_tick(Duration::from_millis(1));
        m.record_task();
        m.record_task();
        m.record_microtask();
        m.record_timer();
        let snap = m.snapshot();
        assert_eq!(snap.ticks, 1);
        assert_eq!(snap.tasks_executed, 2);
        assert_eq!(snap.microtasks_executed, 1);
        assert_eq!(snap.timers_fired, 1);
    }

    #[test]
    fn percentiles_reflect_samples() {
        let m = Metrics::new(true);
        for ms in 1..=100u64 {
            m.record_tick(Duration::from_millis(ms));
        }
        let snap = m.snapshot();
        assert_eq!(snap.p50_tick_latency, Some(Duration::from_millis(51)));
        assert_eq!(snap.p99_tick_latency, Some(Duration::from_millis(100)));
    }

    #[test]
    fn sample_ring_keeps_most_recent_on_overflow() {
        let m = Metrics::new(true);
        for ms in 0..(LATENCY_SAMPLE_CAPACITY as u64 + 10) {
            m.record_tick(Duration::from_millis(ms));
        }
        let snap = m.snapshot();
        // The earliest samples (0..10ms) must have been evicted.
        assert!(snap.p50_tick_latency.unwrap() >= Duration::from_millis(10));
    }
}
