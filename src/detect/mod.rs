//! Anomaly detection, baselines, schema tracking, and incident bookkeeping.

pub mod baseline;
pub mod engine;
pub mod incident;
pub mod schema;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::intake::EndpointKey;

/// Which rule opened an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentType {
    ErrorSpike,
    LatencyRegression,
    TrafficDrop,
    ContractBreak,
}

impl IncidentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentType::ErrorSpike => "ERROR_SPIKE",
            IncidentType::LatencyRegression => "LATENCY_REGRESSION",
            IncidentType::TrafficDrop => "TRAFFIC_DROP",
            IncidentType::ContractBreak => "CONTRACT_BREAK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ERROR_SPIKE" => Some(IncidentType::ErrorSpike),
            "LATENCY_REGRESSION" => Some(IncidentType::LatencyRegression),
            "TRAFFIC_DROP" => Some(IncidentType::TrafficDrop),
            "CONTRACT_BREAK" => Some(IncidentType::ContractBreak),
            _ => None,
        }
    }
}

impl std::fmt::Display for IncidentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity levels for detected incidents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Some(Severity::Low),
            "MEDIUM" => Some(Severity::Medium),
            "HIGH" => Some(Severity::High),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state. Only operators move an incident past OPEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "OPEN",
            IncidentStatus::Acknowledged => "ACKNOWLEDGED",
            IncidentStatus::Resolved => "RESOLVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "OPEN" => Some(IncidentStatus::Open),
            "ACKNOWLEDGED" => Some(IncidentStatus::Acknowledged),
            "RESOLVED" => Some(IncidentStatus::Resolved),
            _ => None,
        }
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub endpoint: EndpointKey,
    pub kind: IncidentType,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub detected_at: DateTime<Utc>,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn open(endpoint: EndpointKey, kind: IncidentType, severity: Severity, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint,
            kind,
            severity,
            status: IncidentStatus::Open,
            detected_at: at,
            triggered_at: at,
            acknowledged_at: None,
            resolved_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceKind {
    Metrics,
    SchemaChange,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::Metrics => "METRICS",
            EvidenceKind::SchemaChange => "SCHEMA_CHANGE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "METRICS" => Some(EvidenceKind::Metrics),
            "SCHEMA_CHANGE" => Some(EvidenceKind::SchemaChange),
            _ => None,
        }
    }
}

/// Snapshot of the numbers that justified an incident. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub kind: EvidenceKind,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_strings_round_trip() {
        for kind in [
            IncidentType::ErrorSpike,
            IncidentType::LatencyRegression,
            IncidentType::TrafficDrop,
            IncidentType::ContractBreak,
        ] {
            assert_eq!(IncidentType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(IncidentType::parse("error_spike"), Some(IncidentType::ErrorSpike));
        assert_eq!(Severity::parse("critical"), Some(Severity::Critical));
        assert_eq!(IncidentStatus::parse("Acknowledged"), Some(IncidentStatus::Acknowledged));
        assert_eq!(IncidentStatus::parse("closed"), None);
    }

    #[test]
    fn test_serde_uses_screaming_case() {
        let json = serde_json::to_string(&IncidentType::LatencyRegression).unwrap();
        assert_eq!(json, "\"LATENCY_REGRESSION\"");
        assert!(Severity::Low < Severity::Critical);
    }
}
