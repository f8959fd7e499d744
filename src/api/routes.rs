//! API route definitions.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use super::state::AppState;
use crate::intake::request_id_of;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(ingest_events))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let (accepted, rejected) = state.intake.counters();
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "endpoints": state.intake.registry().len(),
            "events_accepted": accepted,
            "events_rejected": rejected,
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

/// Queue one record or an array of records for the intake workers.
///
/// Records are validated by the workers; only non-objects are rejected here.
/// A full queue turns the response into 503 so producers can back off.
async fn ingest_events(State(state): State<AppState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let records = match body {
        Value::Array(items) => items,
        other => vec![other],
    };

    let mut accepted = 0usize;
    let mut rejected = 0usize;
    let mut saturated = false;
    for record in records {
        if !record.is_object() {
            rejected += 1;
            continue;
        }
        let request_id = request_id_of(&record).map(str::to_string);
        match state.events.try_send(record) {
            Ok(()) => accepted += 1,
            Err(TrySendError::Full(_)) => {
                saturated = true;
                rejected += 1;
                warn!(request_id = request_id.as_deref().unwrap_or("-"), "intake queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                saturated = true;
                rejected += 1;
                warn!(request_id = request_id.as_deref().unwrap_or("-"), "intake workers stopped, dropping event");
            }
        }
    }

    state.intake.note_rejected(rejected as u64);

    let status = if saturated {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::ACCEPTED
    };
    (
        status,
        Json(json!({ "data": { "accepted": accepted, "rejected": rejected } })),
    )
}
