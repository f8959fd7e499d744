//! Periodic detection scan over every active endpoint.

pub mod engine;

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::detect::baseline::BaselineStore;
use crate::detect::engine::DetectorEngine;
use crate::detect::incident::IncidentLedger;
use crate::detect::schema::SchemaTracker;
use crate::intake::EndpointKey;
use crate::metrics::registry::{EndpointRegistry, EndpointWindows};
use crate::metrics::Granularity;

pub use self::engine::run_scan_loop;

/// What one scan cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub endpoints_scanned: usize,
    /// Endpoints with an empty short window.
    pub endpoints_skipped: usize,
    pub endpoint_failures: usize,
    pub incidents_raised: usize,
    /// Endpoints dropped from the registry after a full long window without traffic.
    pub endpoints_pruned: usize,
}

/// One detection pass: baselines, schema, rules, incidents.
pub struct Scanner {
    registry: Arc<EndpointRegistry>,
    baselines: BaselineStore,
    schemas: SchemaTracker,
    detector: DetectorEngine,
    ledger: IncidentLedger,
}

impl Scanner {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        baselines: BaselineStore,
        schemas: SchemaTracker,
        detector: DetectorEngine,
        ledger: IncidentLedger,
    ) -> Self {
        Self {
            registry,
            baselines,
            schemas,
            detector,
            ledger,
        }
    }

    /// Scan every known endpoint once. A failing endpoint is logged and
    /// counted; the others are still processed.
    pub fn run_cycle(&self) -> ScanSummary {
        let mut summary = ScanSummary {
            endpoints_pruned: self.registry.prune_idle(),
            ..ScanSummary::default()
        };

        for (endpoint, windows) in self.registry.snapshot() {
            match self.scan_endpoint(&endpoint, &windows) {
                Ok(Some(raised)) => {
                    summary.endpoints_scanned += 1;
                    summary.incidents_raised += raised;
                }
                Ok(None) => summary.endpoints_skipped += 1,
                Err(e) => {
                    summary.endpoint_failures += 1;
                    error!(endpoint = %endpoint, error = %e, "scan failed for endpoint");
                }
            }
        }

        info!(
            scanned = summary.endpoints_scanned,
            skipped = summary.endpoints_skipped,
            failures = summary.endpoint_failures,
            incidents = summary.incidents_raised,
            pruned = summary.endpoints_pruned,
            "scan cycle complete"
        );
        summary
    }

    /// Returns `None` when the endpoint had no traffic in the short window.
    fn scan_endpoint(&self, endpoint: &EndpointKey, windows: &EndpointWindows) -> Result<Option<usize>> {
        let short = windows.window(Granularity::Short).stats();
        if short.count == 0 {
            debug!(endpoint = %endpoint, "no recent traffic, skipping");
            return Ok(None);
        }

        let now = self.registry.clock().now();
        let mut long_baseline = None;
        for granularity in Granularity::ALL {
            let current = match granularity {
                Granularity::Short => short,
                other => windows.window(other).stats(),
            };
            let updated = self.baselines.upsert(endpoint, granularity, &current, now)?;
            if granularity == Granularity::Long {
                long_baseline = updated;
            }
        }

        let schema = match windows.latest_fingerprint() {
            Some(fingerprint) => Some(self.schemas.observe(endpoint, &fingerprint, now)?),
            None => None,
        };

        let detections = self
            .detector
            .evaluate(&short, long_baseline.as_ref(), schema.as_ref());

        let raised = detections
            .into_iter()
            .filter_map(|d| self.ledger.raise(endpoint, d.kind, d.severity, d.evidence))
            .count();
        Ok(Some(raised))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectionConfig, WindowConfig};
    use crate::detect::IncidentType;
    use crate::intake::Intake;
    use crate::metrics::clock::ManualClock;
    use crate::rca::dispatch::RcaDispatcher;
    use crate::storage::{open_pool, Store};
    use chrono::{Duration, Utc};
    use serde_json::json;

    struct Harness {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        intake: Intake,
        store: Store,
        scanner: Scanner,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(open_pool(dir.path().join("scan.db").to_str().unwrap()).unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(EndpointRegistry::new(WindowConfig::default(), clock.clone()));
        let scanner = Scanner::new(
            registry.clone(),
            BaselineStore::new(store.clone()),
            SchemaTracker::new(store.clone()),
            DetectorEngine::new(DetectionConfig::default()),
            IncidentLedger::new(store.clone(), RcaDispatcher::disabled(), Duration::minutes(5), clock.clone()),
        );
        Harness {
            _dir: dir,
            clock,
            intake: Intake::new(registry),
            store,
            scanner,
        }
    }

    fn send(intake: &Intake, path: &str, status: u16, latency: u64) {
        intake
            .ingest(json!({"method": "GET", "path": path, "statusCode": status, "latencyMs": latency}))
            .unwrap();
    }

    #[test]
    fn test_idle_endpoints_are_skipped() {
        let h = harness();
        send(&h.intake, "/a", 200, 10);
        h.clock.advance(Duration::minutes(6));

        let summary = h.scanner.run_cycle();
        assert_eq!(summary.endpoints_skipped, 1);
        assert_eq!(summary.endpoints_scanned, 0);
        // Skipped endpoints get no baseline.
        let key = EndpointKey::new("GET", "/a");
        assert!(h.store.get_baseline(&key, Granularity::Long).unwrap().is_none());
    }

    #[test]
    fn test_endpoints_idle_for_a_full_day_are_pruned() {
        let h = harness();
        send(&h.intake, "/a", 200, 10);
        send(&h.intake, "/b", 200, 10);
        h.clock.advance(Duration::hours(23));
        send(&h.intake, "/b", 200, 10);

        let summary = h.scanner.run_cycle();
        assert_eq!(summary.endpoints_pruned, 0);
        assert_eq!(summary.endpoints_skipped, 1);
        assert_eq!(summary.endpoints_scanned, 1);

        h.clock.advance(Duration::hours(2));
        let summary = h.scanner.run_cycle();
        assert_eq!(summary.endpoints_pruned, 1);
        assert_eq!(summary.endpoints_skipped, 1);
        assert_eq!(h.intake.registry().len(), 1);
    }

    #[test]
    fn test_first_cycle_seeds_all_baselines_without_incidents() {
        let h = harness();
        for _ in 0..30 {
            send(&h.intake, "/a", 200, 50);
        }
        let summary = h.scanner.run_cycle();
        assert_eq!(summary.endpoints_scanned, 1);
        assert_eq!(summary.incidents_raised, 0);

        let key = EndpointKey::new("GET", "/a");
        for g in Granularity::ALL {
            let b = h.store.get_baseline(&key, g).unwrap().unwrap();
            assert_eq!(b.request_count, 30);
            assert_eq!(b.p95_ms, 50);
        }
    }

    #[test]
    fn test_failing_endpoint_does_not_stop_others() {
        let h = harness();
        send(&h.intake, "/a", 200, 10);
        send(&h.intake, "/b", 200, 10);
        h.scanner.run_cycle();

        // Corrupt one endpoint's stored baseline so loading it fails.
        h.store
            .pool()
            .get()
            .unwrap()
            .execute(
                "UPDATE endpoint_baselines SET last_computed = 'garbage' WHERE endpoint = 'get:/a'",
                [],
            )
            .unwrap();

        let summary = h.scanner.run_cycle();
        assert_eq!(summary.endpoint_failures, 1);
        assert_eq!(summary.endpoints_scanned, 1);
    }

    #[test]
    fn test_error_spike_raised_once_per_dedup_window() {
        let h = harness();
        for _ in 0..200 {
            send(&h.intake, "/pay", 200, 100);
        }
        assert_eq!(h.scanner.run_cycle().incidents_raised, 0);

        h.clock.advance(Duration::minutes(10));
        for i in 0..40 {
            send(&h.intake, "/pay", if i < 10 { 500 } else { 200 }, 100);
        }
        let summary = h.scanner.run_cycle();
        assert!(summary.incidents_raised >= 1);

        let spikes = h.store.list_incidents(None, Some(IncidentType::ErrorSpike)).unwrap();
        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].endpoint, EndpointKey::new("GET", "/pay"));

        h.clock.advance(Duration::minutes(1));
        h.scanner.run_cycle();
        assert_eq!(h.store.list_incidents(None, Some(IncidentType::ErrorSpike)).unwrap().len(), 1);
    }
}
