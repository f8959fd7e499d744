use serde_json::json;
use tracing::debug;

use crate::config::DetectionConfig;
use crate::detect::baseline::Baseline;
use crate::detect::schema::SchemaObservation;
use crate::detect::{IncidentType, Severity};
use crate::metrics::WindowStats;

/// A rule that fired, with the numbers that made it fire.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub kind: IncidentType,
    pub severity: Severity,
    pub evidence: serde_json::Value,
}

/// Compares the short window of an endpoint against its 24h baseline.
///
/// Every rule is independent; any subset may fire in the same cycle. A
/// missing baseline means "not enough history" and silences the numeric
/// rules only.
pub struct DetectorEngine {
    config: DetectionConfig,
}

impl DetectorEngine {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(
        &self,
        short: &WindowStats,
        long_baseline: Option<&Baseline>,
        schema: Option<&SchemaObservation>,
    ) -> Vec<Detection> {
        let mut detections = Vec::new();
        if let Some(baseline) = long_baseline {
            detections.extend(self.error_spike(short, baseline));
            detections.extend(self.latency_regression(short, baseline));
            detections.extend(self.traffic_drop(short, baseline));
        } else {
            debug!("no long baseline yet, numeric rules skipped");
        }
        if let Some(obs) = schema {
            detections.extend(contract_break(obs));
        }
        detections
    }

    fn error_spike(&self, short: &WindowStats, baseline: &Baseline) -> Option<Detection> {
        let cfg = &self.config.error_spike;
        if short.count < cfg.min_requests {
            return None;
        }
        let spike_threshold = baseline.error_rate_pct * cfg.factor;
        if short.error_rate_pct > cfg.threshold_pct && short.error_rate_pct > spike_threshold {
            return Some(Detection {
                kind: IncidentType::ErrorSpike,
                severity: Severity::High,
                evidence: json!({
                    "current_error_rate_pct": short.error_rate_pct,
                    "baseline_error_rate_pct": baseline.error_rate_pct,
                    "absolute_threshold_pct": cfg.threshold_pct,
                    "factor": cfg.factor,
                    "spike_threshold_pct": spike_threshold,
                    "request_count": short.count,
                    "min_requests": cfg.min_requests,
                }),
            });
        }
        None
    }

    fn latency_regression(&self, short: &WindowStats, baseline: &Baseline) -> Option<Detection> {
        let cfg = &self.config.latency_regression;
        if short.count < cfg.min_requests {
            return None;
        }
        let limit_ms = baseline.p95_ms as f64 * cfg.p95_factor;
        if short.p95_ms as f64 > limit_ms {
            return Some(Detection {
                kind: IncidentType::LatencyRegression,
                severity: Severity::Medium,
                evidence: json!({
                    "current_p95_ms": short.p95_ms,
                    "baseline_p95_ms": baseline.p95_ms,
                    "factor": cfg.p95_factor,
                    "threshold_ms": limit_ms,
                    "current_p50_ms": short.p50_ms,
                    "current_p99_ms": short.p99_ms,
                    "request_count": short.count,
                    "min_requests": cfg.min_requests,
                }),
            });
        }
        None
    }

    fn traffic_drop(&self, short: &WindowStats, baseline: &Baseline) -> Option<Detection> {
        let cfg = &self.config.traffic_drop;
        if short.count == 0 || baseline.request_count < cfg.min_baseline_requests {
            return None;
        }
        let floor = baseline.request_count as f64 * cfg.factor;
        if (short.count as f64) < floor {
            return Some(Detection {
                kind: IncidentType::TrafficDrop,
                severity: Severity::Low,
                evidence: json!({
                    "current_request_count": short.count,
                    "baseline_request_count": baseline.request_count,
                    "factor": cfg.factor,
                    "threshold_request_count": floor,
                    "min_baseline_requests": cfg.min_baseline_requests,
                }),
            });
        }
        None
    }
}

fn contract_break(obs: &SchemaObservation) -> Option<Detection> {
    match obs {
        SchemaObservation::Changed {
            previous_fingerprint,
            previous_version,
            fingerprint,
            version,
        } => Some(Detection {
            kind: IncidentType::ContractBreak,
            severity: Severity::Critical,
            evidence: json!({
                "previous_fingerprint": previous_fingerprint,
                "previous_version": previous_version,
                "fingerprint": fingerprint,
                "version": version,
                "breaking_change": true,
            }),
        }),
        _ => None,
    }
}
