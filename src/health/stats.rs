//! Rolling statistics: latency percentiles, throughput, and error rate over
//! a bounded time/size window.
//!
//! A single mutex guards the deque; it is released on every exit path and
//! never held across user-supplied code.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::uncertainty::kernels::percentile;

/// Retention bounds for rolling statistics (config keys `window_seconds`,
/// `max_samples`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub window_seconds: f64,
    pub max_samples: usize,
    /// P99 latency threshold (ms) for the default alert rule.
    pub latency_threshold_p99_ms: f64,
    /// Error-rate threshold for the default alert rule.
    pub error_rate_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60.0,
            max_samples: 10_000,
            latency_threshold_p99_ms: 50.0,
            error_rate_threshold: 0.01,
        }
    }
}

#[derive(Debug)]
struct StatsState {
    /// FIFO of `(monotonic time, value, success)`.
    samples: VecDeque<(Instant, f64, bool)>,
    /// Lifetime counters — the error rate intentionally spans the whole
    /// process lifetime so early errors stay visible.
    total_count: u64,
    error_count: u64,
}

/// Thread-safe rolling statistics over a time- and size-bounded window.
#[derive(Debug)]
pub struct RollingStatistics {
    window: Duration,
    max_samples: usize,
    start: Instant,
    state: Mutex<StatsState>,
}

impl RollingStatistics {
    #[must_use]
    pub fn new(window_seconds: f64, max_samples: usize) -> Self {
        Self {
            window: Duration::from_secs_f64(window_seconds.max(0.001)),
            max_samples: max_samples.max(1),
            start: Instant::now(),
            state: Mutex::new(StatsState {
                samples: VecDeque::new(),
                total_count: 0,
                error_count: 0,
            }),
        }
    }

    #[must_use]
    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(config.window_seconds, config.max_samples)
    }

    /// Record an observation stamped with the current monotonic time.
    pub fn record(&self, value: f64, success: bool) {
        self.record_at(value, success, Instant::now());
    }

    /// Record an observation with an explicit timestamp (deterministic
    /// tests). Trims by the time cutoff first, then by length.
    pub fn record_at(&self, value: f64, success: bool, at: Instant) {
        let mut state = self.state.lock();
        state.samples.push_back((at, value, success));
        state.total_count += 1;
        if !success {
            state.error_count += 1;
        }

        let cutoff = at.checked_sub(self.window);
        if let Some(cutoff) = cutoff {
            while state
                .samples
                .front()
                .is_some_and(|&(t, _, _)| t < cutoff)
            {
                state.samples.pop_front();
            }
        }
        while state.samples.len() > self.max_samples {
            state.samples.pop_front();
        }
    }

    /// The p-th percentile (0-100) of windowed values, linearly
    /// interpolated. Zero when empty.
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        let values: Vec<f64> = {
            let state = self.state.lock();
            state.samples.iter().map(|&(_, v, _)| v).collect()
        };
        percentile(&values, p)
    }

    /// Mean of windowed values. Zero when empty.
    #[must_use]
    pub fn mean(&self) -> f64 {
        let state = self.state.lock();
        if state.samples.is_empty() {
            return 0.0;
        }
        state.samples.iter().map(|&(_, v, _)| v).sum::<f64>() / state.samples.len() as f64
    }

    /// Operations per second over the effective window (from the older of
    /// the window start and the first retained sample, to now).
    #[must_use]
    pub fn throughput(&self) -> f64 {
        let now = Instant::now();
        let state = self.state.lock();
        let Some(&(first, _, _)) = state.samples.front() else {
            return 0.0;
        };
        let window_start = now.checked_sub(self.window).unwrap_or(self.start);
        let effective_start = first.max(window_start);
        let duration = now.saturating_duration_since(effective_start).as_secs_f64();
        if duration <= 0.0 {
            return 0.0;
        }
        let count = state
            .samples
            .iter()
            .filter(|&&(t, _, _)| t >= window_start)
            .count();
        count as f64 / duration
    }

    /// Errors over total operations, measured over the whole process
    /// lifetime — not the window.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let state = self.state.lock();
        if state.total_count == 0 {
            return 0.0;
        }
        state.error_count as f64 / state.total_count as f64
    }

    /// Lifetime `(total, errors)` counters.
    #[must_use]
    pub fn counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.total_count, state.error_count)
    }

    /// Number of samples currently retained in the window.
    #[must_use]
    pub fn window_len(&self) -> usize {
        self.state.lock().samples.len()
    }

    /// Seconds since construction.
    #[must_use]
    pub fn uptime_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stats_read_zero() {
        let stats = RollingStatistics::new(60.0, 100);
        assert!(stats.percentile(99.0).abs() < f64::EPSILON);
        assert!(stats.mean().abs() < f64::EPSILON);
        assert!(stats.throughput().abs() < f64::EPSILON);
        assert!(stats.error_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn percentiles_interpolate() {
        let stats = RollingStatistics::new(60.0, 1000);
        for i in 1..=100 {
            stats.record(f64::from(i), true);
        }
        assert!((stats.percentile(50.0) - 50.5).abs() < 1e-9);
        assert!((stats.percentile(95.0) - 95.05).abs() < 1e-9);
        assert!((stats.percentile(99.0) - 99.01).abs() < 1e-9);
        assert!((stats.mean() - 50.5).abs() < 1e-9);
    }

    #[test]
    fn time_window_trims_old_samples() {
        let stats = RollingStatistics::new(10.0, 1000);
        let now = Instant::now();
        stats.record_at(1.0, true, now.checked_sub(Duration::from_secs(30)).unwrap());
        stats.record_at(2.0, true, now.checked_sub(Duration::from_secs(5)).unwrap());
        stats.record_at(3.0, true, now);
        // The 30s-old sample fell out of the 10s window.
        assert_eq!(stats.window_len(), 2);
        assert!((stats.mean() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn size_bound_trims_after_time_bound() {
        let stats = RollingStatistics::new(3600.0, 5);
        for i in 0..20 {
            stats.record(f64::from(i), true);
        }
        assert_eq!(stats.window_len(), 5);
        // Oldest retained value is 15.
        assert!((stats.percentile(0.0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn error_rate_spans_process_lifetime() {
        let stats = RollingStatistics::new(0.010, 1000);
        let now = Instant::now();
        // Two early errors that will leave the 10ms window.
        stats.record_at(1.0, false, now.checked_sub(Duration::from_secs(60)).unwrap());
        stats.record_at(1.0, false, now.checked_sub(Duration::from_secs(59)).unwrap());
        stats.record_at(1.0, true, now);
        stats.record_at(1.0, true, now);

        // Window holds only recent successes, yet the lifetime error rate
        // still reports the early failures.
        assert!(stats.window_len() <= 2);
        assert!((stats.error_rate() - 0.5).abs() < 1e-9);
        assert_eq!(stats.counts(), (4, 2));
    }

    #[test]
    fn throughput_counts_window_entries() {
        let stats = RollingStatistics::new(60.0, 1000);
        let now = Instant::now();
        for i in 0..10 {
            stats.record_at(
                1.0,
                true,
                now.checked_sub(Duration::from_secs(10 - i)).unwrap(),
            );
        }
        let throughput = stats.throughput();
        // 10 samples over an effective ~10s window.
        assert!(throughput > 0.7, "throughput {throughput}");
        assert!(throughput < 1.3, "throughput {throughput}");
    }

    #[test]
    fn uptime_is_monotone() {
        let stats = RollingStatistics::new(60.0, 10);
        assert!(stats.uptime_seconds() >= 0.0);
    }

    #[test]
    fn concurrent_recording_is_safe() {
        use std::sync::Arc;
        let stats = Arc::new(RollingStatistics::new(60.0, 100_000));
        let mut handles = Vec::new();
        for t in 0..4 {
            let stats = Arc::clone(&stats);
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    stats.record(f64::from(t * 500 + i), i % 10 != 0);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let (total, errors) = stats.counts();
        assert_eq!(total, 2000);
        assert_eq!(errors, 200);
    }
}
