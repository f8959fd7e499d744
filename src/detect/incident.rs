use std::sync::Arc;

use chrono::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::detect::{Evidence, EvidenceKind, Incident, IncidentType, Severity};
use crate::intake::EndpointKey;
use crate::metrics::clock::Clock;
use crate::rca::dispatch::RcaDispatcher;
use crate::storage::Store;

/// Opens incidents, at most one OPEN per (endpoint, type) per dedup window.
pub struct IncidentLedger {
    store: Store,
    dispatcher: RcaDispatcher,
    dedup_window: Duration,
    clock: Arc<dyn Clock>,
}

impl IncidentLedger {
    pub fn new(store: Store, dispatcher: RcaDispatcher, dedup_window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            dispatcher,
            dedup_window,
            clock,
        }
    }

    /// Open a new incident with its evidence unless an OPEN one of the same
    /// type was detected for the endpoint within the dedup window.
    ///
    /// Returns the new incident id, or `None` when suppressed or when it
    /// could not be stored. RCA generation is queued, never awaited.
    pub fn raise(
        &self,
        endpoint: &EndpointKey,
        kind: IncidentType,
        severity: Severity,
        evidence: serde_json::Value,
    ) -> Option<Uuid> {
        let now = self.clock.now();
        let incident = Incident::open(endpoint.clone(), kind, severity, now);
        let evidence = Evidence {
            id: Uuid::new_v4(),
            incident_id: incident.id,
            kind: match kind {
                IncidentType::ContractBreak => EvidenceKind::SchemaChange,
                _ => EvidenceKind::Metrics,
            },
            data: evidence,
            created_at: now,
        };

        match self
            .store
            .insert_incident_deduped(&incident, &evidence, now - self.dedup_window)
        {
            Ok(true) => {
                warn!(
                    incident_id = %incident.id,
                    endpoint = %endpoint,
                    kind = %kind,
                    severity = %severity,
                    "INCIDENT DETECTED"
                );
                self.dispatcher.dispatch(incident.id);
                Some(incident.id)
            }
            Ok(false) => {
                info!(
                    endpoint = %endpoint,
                    kind = %kind,
                    "open incident of this type already exists in dedup window, skipping"
                );
                None
            }
            Err(e) => {
                error!(endpoint = %endpoint, kind = %kind, error = %e, "failed to persist incident");
                None
            }
        }
    }
}
