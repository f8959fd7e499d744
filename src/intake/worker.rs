//! Ingestion worker pool fed by a bounded queue of raw records.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{request_id_of, Intake};

/// Producer side handed to transports.
pub type IntakeSender = mpsc::Sender<Value>;

pub fn channel(capacity: usize) -> (IntakeSender, mpsc::Receiver<Value>) {
    mpsc::channel(capacity.max(1))
}

/// Spawn `workers` tasks that drain the queue into `intake`.
///
/// Workers exit once every sender is dropped and the queue is empty.
pub fn spawn_workers(
    intake: Arc<Intake>,
    rx: mpsc::Receiver<Value>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..workers.max(1))
        .map(|worker| {
            let intake = intake.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    // Hold the receiver lock only while waiting for the next record.
                    let next = { rx.lock().await.recv().await };
                    let Some(value) = next else { break };

                    let request_id = request_id_of(&value).map(str::to_string);
                    if let Err(e) = intake.ingest(value) {
                        warn!(
                            worker,
                            request_id = request_id.as_deref().unwrap_or("-"),
                            error = %e,
                            "dropping malformed event"
                        );
                    }
                }
                info!(worker, "intake worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;
    use crate::intake::EndpointKey;
    use crate::metrics::clock::SystemClock;
    use crate::metrics::registry::EndpointRegistry;
    use serde_json::json;

    #[tokio::test]
    async fn test_workers_drain_queue_and_skip_bad_records() {
        let registry = Arc::new(EndpointRegistry::new(WindowConfig::default(), Arc::new(SystemClock)));
        let intake = Arc::new(Intake::new(registry.clone()));
        let (tx, rx) = channel(64);
        let handles = spawn_workers(intake.clone(), rx, 3);

        for i in 0..20 {
            tx.send(json!({"method": "GET", "path": "/ping", "statusCode": 200, "latencyMs": i}))
                .await
                .unwrap();
        }
        tx.send(json!({"requestId": "broken", "method": "GET"})).await.unwrap();
        drop(tx);

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(intake.counters(), (20, 1));
        let windows = registry.get(&EndpointKey::new("GET", "/ping")).unwrap();
        assert_eq!(windows.short.count(), 20);
    }
}
