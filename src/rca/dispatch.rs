//! Fire-and-forget RCA dispatch: a bounded queue of incident ids drained by
//! a fixed pool of workers. Nothing but the id crosses the queue.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{RcaGenerator, RcaReport, RcaStatus};
use crate::metrics::clock::Clock;
use crate::storage::Store;

/// Sending half held by the incident ledger.
#[derive(Clone, Debug)]
pub struct RcaDispatcher {
    tx: Option<mpsc::Sender<Uuid>>,
}

impl RcaDispatcher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Uuid>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A dispatcher that drops every request. Incidents stay without a report.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue RCA generation without waiting. Returns false if it was not queued.
    pub fn dispatch(&self, incident_id: Uuid) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(incident_id) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%incident_id, "RCA queue full, incident left without report");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(%incident_id, "RCA workers stopped, incident left without report");
                false
            }
        }
    }
}

pub fn spawn_workers(
    rx: mpsc::Receiver<Uuid>,
    workers: usize,
    store: Store,
    generator: Arc<dyn RcaGenerator>,
    clock: Arc<dyn Clock>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..workers.max(1))
        .map(|worker| {
            let rx = rx.clone();
            let store = store.clone();
            let generator = generator.clone();
            let clock = clock.clone();
            tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(incident_id) = next else { break };
                    if let Err(e) = process(&store, generator.as_ref(), clock.as_ref(), incident_id).await {
                        error!(worker, %incident_id, error = %e, "RCA processing failed");
                    }
                }
                info!(worker, "RCA worker stopped");
            })
        })
        .collect()
}

/// Generate and store the report for one incident.
///
/// Returns `None` when the incident no longer exists.
pub async fn process(
    store: &Store,
    generator: &dyn RcaGenerator,
    clock: &dyn Clock,
    incident_id: Uuid,
) -> Result<Option<RcaStatus>> {
    let loader = store.clone();
    let (incident, evidence) = tokio::task::spawn_blocking(move || -> Result<_> {
        let incident = loader.get_incident(incident_id)?;
        let evidence = loader.evidence_for(incident_id)?;
        Ok((incident, evidence))
    })
    .await
    .context("incident loader panicked")??;

    let Some(incident) = incident else {
        warn!(%incident_id, "incident not found for RCA generation");
        return Ok(None);
    };

    let report = match generator.generate(&incident, &evidence).await {
        Ok(report) => report,
        Err(e) => {
            error!(%incident_id, error = %e, "RCA generation failed");
            RcaReport::failed(&incident, &e, clock.now())
        }
    };
    let status = report.status;

    let saver = store.clone();
    tokio::task::spawn_blocking(move || saver.save_rca_report(&report))
        .await
        .context("RCA report writer panicked")??;

    info!(%incident_id, status = status.as_str(), "RCA report stored");
    Ok(Some(status))
}
