use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::Scanner;

/// Main scan loop. Cycles never overlap: a tick that fires while a cycle is
/// still running is skipped.
pub async fn run_scan_loop(scanner: Arc<Scanner>, every: Duration) {
    info!(interval_secs = every.as_secs(), "Scan loop started");

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; give intake one interval to fill windows.
    interval.tick().await;

    loop {
        interval.tick().await;

        let scanner = scanner.clone();
        // Storage calls block, so the cycle runs off the async workers.
        match tokio::task::spawn_blocking(move || scanner.run_cycle()).await {
            Ok(_summary) => {}
            Err(e) => error!("Scan cycle panicked: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectionConfig, WindowConfig};
    use crate::detect::baseline::BaselineStore;
    use crate::detect::engine::DetectorEngine;
    use crate::detect::incident::IncidentLedger;
    use crate::detect::schema::SchemaTracker;
    use crate::intake::{EndpointKey, Intake};
    use crate::metrics::clock::SystemClock;
    use crate::metrics::registry::EndpointRegistry;
    use crate::metrics::Granularity;
    use crate::rca::dispatch::RcaDispatcher;
    use crate::storage::{open_pool, Store};

    #[tokio::test]
    async fn test_loop_runs_cycles_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(open_pool(dir.path().join("loop.db").to_str().unwrap()).unwrap());
        let clock = Arc::new(SystemClock);
        let registry = Arc::new(EndpointRegistry::new(WindowConfig::default(), clock.clone()));
        let scanner = Arc::new(Scanner::new(
            registry.clone(),
            BaselineStore::new(store.clone()),
            SchemaTracker::new(store.clone()),
            DetectorEngine::new(DetectionConfig::default()),
            IncidentLedger::new(store.clone(), RcaDispatcher::disabled(), chrono::Duration::minutes(5), clock),
        ));
        Intake::new(registry)
            .ingest(serde_json::json!({"method": "GET", "path": "/x", "statusCode": 200, "latencyMs": 5}))
            .unwrap();

        let handle = tokio::spawn(run_scan_loop(scanner, Duration::from_millis(20)));
        let key = EndpointKey::new("GET", "/x");
        let mut seeded = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if store.get_baseline(&key, Granularity::Short).unwrap().is_some() {
                seeded = true;
                break;
            }
        }
        handle.abort();
        assert!(seeded, "scan loop never produced a baseline");
    }
}
