use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::intake::EndpointKey;
use crate::metrics::{mean_pct, Granularity, WindowStats};
use crate::storage::Store;

/// Smoothed historical statistics for one endpoint and granularity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub endpoint: EndpointKey,
    pub granularity: Granularity,
    pub error_rate_pct: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub request_count: u64,
    pub last_computed: DateTime<Utc>,
}

impl Baseline {
    /// First baseline for an endpoint: the current window verbatim.
    pub fn seed(endpoint: EndpointKey, granularity: Granularity, current: &WindowStats, now: DateTime<Utc>) -> Self {
        Self {
            endpoint,
            granularity,
            error_rate_pct: current.error_rate_pct.clamp(0.0, 100.0),
            p50_ms: current.p50_ms,
            p95_ms: current.p95_ms,
            p99_ms: current.p99_ms,
            request_count: current.count,
            last_computed: now,
        }
    }

    /// Unweighted mean of this baseline and the current window, field by field.
    ///
    /// Integer fields halve with truncation; the error rate is rounded to
    /// 4 decimals half-up.
    pub fn blend(&self, current: &WindowStats, now: DateTime<Utc>) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            granularity: self.granularity,
            error_rate_pct: mean_pct(self.error_rate_pct, current.error_rate_pct),
            p50_ms: mean_u64(self.p50_ms, current.p50_ms),
            p95_ms: mean_u64(self.p95_ms, current.p95_ms),
            p99_ms: mean_u64(self.p99_ms, current.p99_ms),
            request_count: mean_u64(self.request_count, current.count),
            last_computed: now,
        }
    }
}

fn mean_u64(a: u64, b: u64) -> u64 {
    // Overflow-free (a + b) / 2.
    a / 2 + b / 2 + (a % 2 + b % 2) / 2
}

/// Latest baseline per endpoint and granularity, backed by the store.
#[derive(Clone)]
pub struct BaselineStore {
    store: Store,
}

impl BaselineStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Seed or blend the baseline with `current`. A no-op when the window is empty.
    pub fn upsert(
        &self,
        endpoint: &EndpointKey,
        granularity: Granularity,
        current: &WindowStats,
        now: DateTime<Utc>,
    ) -> Result<Option<Baseline>> {
        if current.count == 0 {
            return Ok(None);
        }
        let next = match self.store.get_baseline(endpoint, granularity)? {
            Some(existing) => existing.blend(current, now),
            None => Baseline::seed(endpoint.clone(), granularity, current, now),
        };
        self.store.put_baseline(&next)?;
        debug!(
            endpoint = %endpoint,
            granularity = %granularity,
            error_rate_pct = next.error_rate_pct,
            p95_ms = next.p95_ms,
            request_count = next.request_count,
            "baseline updated"
        );
        Ok(Some(next))
    }

    pub fn get(&self, endpoint: &EndpointKey, granularity: Granularity) -> Result<Option<Baseline>> {
        self.store.get_baseline(endpoint, granularity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;

    fn stats(count: u64, error_rate_pct: f64, p50: u64, p95: u64, p99: u64) -> WindowStats {
        WindowStats {
            count,
            error_rate_pct,
            p50_ms: p50,
            p95_ms: p95,
            p99_ms: p99,
        }
    }

    #[test]
    fn test_blend_is_field_wise_mean() {
        let now = Utc::now();
        let key = EndpointKey::new("GET", "/a");
        let existing = Baseline::seed(key, Granularity::Long, &stats(100, 5.0, 40, 200, 301), now);
        let blended = existing.blend(&stats(41, 12.3334, 61, 500, 900), now);

        assert_eq!(blended.request_count, 70);
        assert_eq!(blended.error_rate_pct, 8.6667);
        assert_eq!(blended.p50_ms, 50);
        assert_eq!(blended.p95_ms, 350);
        assert_eq!(blended.p99_ms, 600);
    }

    #[test]
    fn test_blend_rounds_error_rate_ties_up() {
        let now = Utc::now();
        let key = EndpointKey::new("GET", "/a");
        let zero = Baseline::seed(key.clone(), Granularity::Long, &stats(10, 0.0, 1, 1, 1), now);
        assert_eq!(zero.blend(&stats(10, 0.0003, 1, 1, 1), now).error_rate_pct, 0.0002);

        let low = Baseline::seed(key, Granularity::Long, &stats(10, 0.0005, 1, 1, 1), now);
        assert_eq!(low.blend(&stats(10, 0.0006, 1, 1, 1), now).error_rate_pct, 0.0006);
    }

    #[test]
    fn test_blend_is_commutative() {
        let now = Utc::now();
        let key = EndpointKey::new("GET", "/a");
        let a = stats(33, 7.25, 10, 99, 150);
        let b = stats(80, 0.5, 30, 12, 400);

        let ab = Baseline::seed(key.clone(), Granularity::Short, &a, now).blend(&b, now);
        let ba = Baseline::seed(key, Granularity::Short, &b, now).blend(&a, now);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_mean_u64_does_not_overflow() {
        assert_eq!(mean_u64(u64::MAX, u64::MAX), u64::MAX);
        assert_eq!(mean_u64(3, 4), 3);
        assert_eq!(mean_u64(0, 0), 0);
    }

    #[test]
    fn test_upsert_seeds_then_blends_and_skips_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::new(open_pool(dir.path().join("t.db").to_str().unwrap())?);
        let baselines = BaselineStore::new(store);
        let key = EndpointKey::new("GET", "/orders");
        let now = Utc::now();

        assert!(baselines.get(&key, Granularity::Long)?.is_none());
        assert!(baselines.upsert(&key, Granularity::Long, &stats(0, 0.0, 0, 0, 0), now)?.is_none());
        assert!(baselines.get(&key, Granularity::Long)?.is_none());

        baselines.upsert(&key, Granularity::Long, &stats(100, 5.0, 50, 200, 300), now)?;
        let seeded = baselines.get(&key, Granularity::Long)?.unwrap();
        assert_eq!(seeded.request_count, 100);
        assert_eq!(seeded.p95_ms, 200);

        baselines.upsert(&key, Granularity::Long, &stats(40, 25.0, 70, 500, 700), now)?;
        let blended = baselines.get(&key, Granularity::Long)?.unwrap();
        assert_eq!(blended.request_count, 70);
        assert_eq!(blended.error_rate_pct, 15.0);
        assert_eq!(blended.p95_ms, 350);

        // Other granularities are independent.
        assert!(baselines.get(&key, Granularity::Short)?.is_none());
        Ok(())
    }
}
