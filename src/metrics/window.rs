//! Sliding time window of request samples for one endpoint and granularity.
//!
//! Samples are appended in clock order under a short lock that also evicts
//! everything older than the window span, so the running aggregates always
//! equal the sum over the retained samples. Percentiles are computed on a
//! copy of the retained latencies, sorted outside the lock.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use super::clock::Clock;
use super::WindowStats;

/// Per-mille quantiles used by the detectors and baselines.
pub const P50: u64 = 500;
pub const P95: u64 = 950;
pub const P99: u64 = 990;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: DateTime<Utc>,
    latency_ms: u64,
    is_error: bool,
}

#[derive(Debug, Default)]
struct WindowState {
    samples: VecDeque<Sample>,
    count: u64,
    errors: u64,
    latency_sum: u64,
}

impl WindowState {
    fn evict(&mut self, cutoff: DateTime<Utc>) {
        while let Some(head) = self.samples.front() {
            if head.at >= cutoff {
                break;
            }
            let head = *head;
            self.samples.pop_front();
            self.count -= 1;
            self.latency_sum -= head.latency_ms;
            if head.is_error {
                self.errors -= 1;
            }
        }
    }

    fn push(&mut self, sample: Sample) {
        self.count += 1;
        self.latency_sum += sample.latency_ms;
        if sample.is_error {
            self.errors += 1;
        }
        self.samples.push_back(sample);
    }
}

/// Concurrent rolling aggregate over the trailing `span` of time.
pub struct RollingWindow {
    span: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<WindowState>,
}

impl RollingWindow {
    pub fn new(span: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            span,
            clock,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn span(&self) -> Duration {
        self.span
    }

    /// Append a sample stamped with the current time.
    pub fn record(&self, latency_ms: u64, is_error: bool) {
        let mut state = self.state.lock();
        // Read the clock under the lock so samples stay ordered by time.
        let now = self.clock.now();
        state.evict(now - self.span);
        state.push(Sample {
            at: now,
            latency_ms,
            is_error,
        });
    }

    pub fn count(&self) -> u64 {
        let mut state = self.state.lock();
        state.evict(self.clock.now() - self.span);
        state.count
    }

    pub fn error_rate_pct(&self) -> f64 {
        let mut state = self.state.lock();
        state.evict(self.clock.now() - self.span);
        super::error_rate_pct(state.errors, state.count)
    }

    /// Mean latency of retained samples, 0 when empty.
    pub fn mean_latency_ms(&self) -> f64 {
        let mut state = self.state.lock();
        state.evict(self.clock.now() - self.span);
        if state.count == 0 {
            return 0.0;
        }
        state.latency_sum as f64 / state.count as f64
    }

    pub fn p50(&self) -> u64 {
        percentile(&self.sorted_latencies(), P50)
    }

    pub fn p95(&self) -> u64 {
        percentile(&self.sorted_latencies(), P95)
    }

    pub fn p99(&self) -> u64 {
        percentile(&self.sorted_latencies(), P99)
    }

    /// All statistics from a single consistent view of the window.
    pub fn stats(&self) -> WindowStats {
        let (count, errors, mut latencies) = {
            let mut state = self.state.lock();
            state.evict(self.clock.now() - self.span);
            let latencies: Vec<u64> = state.samples.iter().map(|s| s.latency_ms).collect();
            (state.count, state.errors, latencies)
        };
        latencies.sort_unstable();

        WindowStats {
            count,
            error_rate_pct: super::error_rate_pct(errors, count),
            p50_ms: percentile(&latencies, P50),
            p95_ms: percentile(&latencies, P95),
            p99_ms: percentile(&latencies, P99),
        }
    }

    fn sorted_latencies(&self) -> Vec<u64> {
        let mut latencies: Vec<u64> = {
            let mut state = self.state.lock();
            state.evict(self.clock.now() - self.span);
            state.samples.iter().map(|s| s.latency_ms).collect()
        };
        latencies.sort_unstable();
        latencies
    }
}

/// Nearest-rank percentile: index = ceil(q * n) - 1, clamped to [0, n-1].
///
/// `per_mille` is the quantile times 1000 so the rank is computed exactly.
pub fn percentile(sorted: &[u64], per_mille: u64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let n = sorted.len() as u64;
    let rank = (per_mille * n).div_ceil(1000);
    let index = rank.saturating_sub(1).min(n - 1);
    sorted[index as usize]
}
