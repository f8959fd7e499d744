//! Inbound telemetry normalization.
//!
//! Every record delivered by a transport is parsed into a [`TelemetryEvent`]
//! and keyed by its [`EndpointKey`]. Malformed records are rejected with an
//! [`IngestError`]; the caller logs and drops them.

pub mod replay;
pub mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::metrics::registry::EndpointRegistry;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("event is not a JSON object")]
    NotAnObject,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("status code {0} is out of range")]
    InvalidStatus(i64),
    #[error("latency {0}ms is negative")]
    NegativeLatency(i64),
    #[error("unparsable timestamp '{0}'")]
    InvalidTimestamp(String),
}

/// Stable identifier of a monitored (method, path) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointKey(String);

impl EndpointKey {
    pub fn new(method: &str, path: &str) -> Self {
        Self(format!("{}:{}", method.trim(), path.trim()).to_lowercase())
    }

    /// Wrap an already-derived key, e.g. one read back from storage.
    pub fn from_stored(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A normalized API call observation.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub endpoint: EndpointKey,
    pub status_code: u16,
    pub latency_ms: u64,
    pub is_error: bool,
    pub schema_fingerprint: Option<String>,
}

/// Wire shape of an inbound record. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    request_id: Option<String>,
    timestamp: Option<String>,
    method: Option<String>,
    path: Option<String>,
    status_code: Option<i64>,
    latency_ms: Option<i64>,
    schema_fingerprint: Option<String>,
}

impl TelemetryEvent {
    /// Parse and validate one inbound record. `now` stands in for a missing timestamp.
    pub fn from_value(value: Value, now: DateTime<Utc>) -> Result<Self, IngestError> {
        if !value.is_object() {
            return Err(IngestError::NotAnObject);
        }
        let raw: RawEvent = serde_json::from_value(value)?;

        let method = non_empty(raw.method).ok_or(IngestError::MissingField("method"))?;
        let path = non_empty(raw.path).ok_or(IngestError::MissingField("path"))?;
        let status = raw.status_code.ok_or(IngestError::MissingField("statusCode"))?;
        if !(100..=599).contains(&status) {
            return Err(IngestError::InvalidStatus(status));
        }
        let latency = raw.latency_ms.ok_or(IngestError::MissingField("latencyMs"))?;
        if latency < 0 {
            return Err(IngestError::NegativeLatency(latency));
        }
        let timestamp = match non_empty(raw.timestamp) {
            Some(ts) => parse_timestamp(&ts)?,
            None => now,
        };

        Ok(Self {
            request_id: raw.request_id,
            timestamp,
            endpoint: EndpointKey::new(&method, &path),
            status_code: status as u16,
            latency_ms: latency as u64,
            is_error: status >= 400,
            schema_fingerprint: non_empty(raw.schema_fingerprint),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Naive local-time layouts the collector emits. Seconds are omitted when zero.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// RFC 3339, or one of the collector's naive layouts read as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, IngestError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| IngestError::InvalidTimestamp(raw.to_string()))
}

/// Best-effort request id for logging a record that failed to parse.
pub fn request_id_of(value: &Value) -> Option<&str> {
    value.get("requestId").and_then(Value::as_str)
}

/// Write side of the pipeline: parses records and folds them into the registry.
pub struct Intake {
    registry: Arc<EndpointRegistry>,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl Intake {
    pub fn new(registry: Arc<EndpointRegistry>) -> Self {
        Self {
            registry,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Parse one record and record it. Never panics on bad input.
    pub fn ingest(&self, value: Value) -> Result<EndpointKey, IngestError> {
        let now = self.registry.clock().now();
        match TelemetryEvent::from_value(value, now) {
            Ok(event) => {
                debug!(
                    endpoint = %event.endpoint,
                    request_id = event.request_id.as_deref().unwrap_or("-"),
                    status = event.status_code,
                    latency_ms = event.latency_ms,
                    "event recorded"
                );
                self.registry.record(&event);
                self.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(event.endpoint)
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Count records turned away before they reached parsing.
    pub fn note_rejected(&self, n: u64) {
        if n > 0 {
            self.rejected.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// (accepted, rejected) since startup.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.accepted.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_key_is_case_normalized() {
        assert_eq!(EndpointKey::new("GET", "/Users/42"), EndpointKey::new("get", "/users/42"));
        assert_ne!(EndpointKey::new("GET", "/users"), EndpointKey::new("POST", "/users"));
        assert_eq!(EndpointKey::new("Get", "/a").as_str(), "get:/a");
    }

    #[test]
    fn test_parse_full_record() {
        let now = Utc::now();
        let event = TelemetryEvent::from_value(
            json!({
                "requestId": "r-1",
                "timestamp": "2025-01-02T03:04:05.123456",
                "method": "POST",
                "path": "/orders",
                "statusCode": 503,
                "latencyMs": 812,
                "schemaFingerprint": "abc",
                "serviceName": "orders",
                "reqHeaders": {"x": "y"}
            }),
            now,
        )
        .unwrap();

        assert_eq!(event.endpoint.as_str(), "post:/orders");
        assert!(event.is_error);
        assert_eq!(event.latency_ms, 812);
        assert_eq!(event.schema_fingerprint.as_deref(), Some("abc"));
        assert_eq!(event.timestamp.to_rfc3339(), "2025-01-02T03:04:05.123456+00:00");
    }

    #[test]
    fn test_accepts_minute_precision_timestamp() {
        let event = TelemetryEvent::from_value(
            json!({"timestamp": "2025-01-02T03:04", "method": "GET", "path": "/", "statusCode": 200, "latencyMs": 7}),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(event.timestamp.to_rfc3339(), "2025-01-02T03:04:00+00:00");

        let zoned = parse_timestamp("2025-01-02T03:04:05+02:00").unwrap();
        assert_eq!(zoned.to_rfc3339(), "2025-01-02T01:04:05+00:00");
        assert!(parse_timestamp("2025-01-02").is_err());
    }

    #[test]
    fn test_missing_timestamp_defaults_to_now() {
        let now = Utc::now();
        let event = TelemetryEvent::from_value(
            json!({"method": "GET", "path": "/", "statusCode": 200, "latencyMs": 0, "schemaFingerprint": ""}),
            now,
        )
        .unwrap();
        assert_eq!(event.timestamp, now);
        assert!(!event.is_error);
        assert!(event.schema_fingerprint.is_none());
    }

    #[test]
    fn test_status_400_is_an_error() {
        let event = TelemetryEvent::from_value(
            json!({"method": "GET", "path": "/", "statusCode": 400, "latencyMs": 5}),
            Utc::now(),
        )
        .unwrap();
        assert!(event.is_error);
    }

    #[test]
    fn test_rejects_malformed_records() {
        let now = Utc::now();
        let cases = [
            json!({"path": "/", "statusCode": 200, "latencyMs": 1}),
            json!({"method": "GET", "path": " ", "statusCode": 200, "latencyMs": 1}),
            json!({"method": "GET", "path": "/", "latencyMs": 1}),
            json!({"method": "GET", "path": "/", "statusCode": 200}),
            json!({"method": "GET", "path": "/", "statusCode": 200, "latencyMs": -3}),
            json!({"method": "GET", "path": "/", "statusCode": 42, "latencyMs": 1}),
            json!({"method": "GET", "path": "/", "statusCode": "200", "latencyMs": 1}),
            json!({"method": "GET", "path": "/", "statusCode": 200, "latencyMs": 1, "timestamp": "yesterday"}),
            json!(["not", "an", "object"]),
        ];
        for case in cases {
            assert!(TelemetryEvent::from_value(case.clone(), now).is_err(), "accepted {case}");
        }
    }

    #[test]
    fn test_request_id_is_extracted_for_logging() {
        let value = json!({"requestId": "abc", "statusCode": "bad"});
        assert_eq!(request_id_of(&value), Some("abc"));
        assert_eq!(request_id_of(&json!({})), None);
    }
}
