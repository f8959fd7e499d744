//! Rolling per-endpoint request statistics.

pub mod clock;
pub mod registry;
pub mod window;

use serde::{Deserialize, Serialize};

/// One of the three rolling-window durations tracked per endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Short,
    Medium,
    Long,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Short, Granularity::Medium, Granularity::Long];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Short => "short",
            Granularity::Medium => "medium",
            Granularity::Long => "long",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "short" => Some(Granularity::Short),
            "medium" => Some(Granularity::Medium),
            "long" => Some(Granularity::Long),
            _ => None,
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time statistics of a rolling window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub count: u64,
    pub error_rate_pct: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

/// Percentages are carried as integer ten-thousandths of a percent so that
/// 4-decimal half-up rounding is exact.
const PCT_UNITS: u64 = 10_000;
const MAX_PCT_UNITS: u64 = 100 * PCT_UNITS;

/// `errors / count * 100`, rounded to 4 decimals half-up. Zero for an empty window.
pub fn error_rate_pct(errors: u64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    let errors = u128::from(errors.min(count));
    let count = u128::from(count);
    // Half-up of errors * 1_000_000 / count, in integers.
    let units = (errors * 2 * u128::from(MAX_PCT_UNITS) + count) / (2 * count);
    units_to_pct(units as u64)
}

/// Mean of two 4-decimal percentages, rounded to 4 decimals half-up.
pub fn mean_pct(a: f64, b: f64) -> f64 {
    units_to_pct((pct_to_units(a) + pct_to_units(b) + 1) / 2)
}

/// A stored 4-decimal percentage back to integer units, clamped to 0..=100%.
fn pct_to_units(value: f64) -> u64 {
    if !value.is_finite() {
        return 0;
    }
    ((value * PCT_UNITS as f64).round() as u64).min(MAX_PCT_UNITS)
}

fn units_to_pct(units: u64) -> f64 {
    units.min(MAX_PCT_UNITS) as f64 / PCT_UNITS as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rate_pct() {
        assert_eq!(error_rate_pct(1, 3), 33.3333);
        assert_eq!(error_rate_pct(2, 3), 66.6667);
        assert_eq!(error_rate_pct(0, 0), 0.0);
        assert_eq!(error_rate_pct(0, 7), 0.0);
        assert_eq!(error_rate_pct(7, 7), 100.0);
    }

    #[test]
    fn test_error_rate_pct_rounds_ties_up() {
        // 23 / 640 = 3.59375% exactly.
        assert_eq!(error_rate_pct(23, 640), 3.5938);
        // 1 / 160000 = 0.000625%.
        assert_eq!(error_rate_pct(1, 160_000), 0.0006);
        // 1 / 3200 = 0.03125%.
        assert_eq!(error_rate_pct(1, 3200), 0.0313);
    }

    #[test]
    fn test_error_rate_pct_never_exceeds_hundred() {
        assert_eq!(error_rate_pct(u64::MAX, u64::MAX), 100.0);
        assert_eq!(error_rate_pct(5, 3), 100.0);
    }

    #[test]
    fn test_mean_pct_rounds_ties_up() {
        assert_eq!(mean_pct(0.0, 0.0003), 0.0002);
        assert_eq!(mean_pct(0.0005, 0.0006), 0.0006);
        assert_eq!(mean_pct(5.0, 12.3334), 8.6667);
        assert_eq!(mean_pct(100.0, 100.0), 100.0);
        assert_eq!(mean_pct(0.0, 0.0), 0.0);
    }

    #[test]
    fn test_mean_pct_is_commutative() {
        for (a, b) in [(0.0001, 0.0004), (3.5937, 3.5938), (99.9999, 0.0001)] {
            assert_eq!(mean_pct(a, b), mean_pct(b, a));
        }
    }

    #[test]
    fn test_granularity_round_trips_through_str() {
        for g in Granularity::ALL {
            assert_eq!(Granularity::parse(g.as_str()), Some(g));
        }
        assert_eq!(Granularity::parse("hourly"), None);
    }
}
