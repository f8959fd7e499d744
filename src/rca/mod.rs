//! Root-cause analysis reports, produced asynchronously per incident.

pub mod dispatch;
pub mod openai;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::detect::{Evidence, Incident};

#[derive(Debug, Error)]
pub enum RcaError {
    #[error("request to summarizer failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("summarizer returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("summarizer response did not contain message content")]
    MissingContent,
    #[error("summarizer payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RcaStatus {
    Generated,
    Skipped,
    Failed,
}

impl RcaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RcaStatus::Generated => "GENERATED",
            RcaStatus::Skipped => "SKIPPED",
            RcaStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GENERATED" => Some(RcaStatus::Generated),
            "SKIPPED" => Some(RcaStatus::Skipped),
            "FAILED" => Some(RcaStatus::Failed),
            _ => None,
        }
    }
}

/// Narrative root-cause report attached to an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RcaReport {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub status: RcaStatus,
    pub root_cause_summary: String,
    pub likely_trigger: String,
    pub affected_endpoints: Vec<String>,
    pub severity_reason: String,
    pub recommended_fixes: Vec<String>,
    pub rollback_or_patch: String,
    /// In [0, 1].
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RcaReport {
    fn blank(incident: &Incident, status: RcaStatus, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            incident_id: incident.id,
            status,
            root_cause_summary: String::new(),
            likely_trigger: "N/A".to_string(),
            affected_endpoints: vec![incident.endpoint.to_string()],
            severity_reason: "N/A".to_string(),
            recommended_fixes: Vec::new(),
            rollback_or_patch: "N/A".to_string(),
            confidence: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Report recorded when no summarizer credentials are configured.
    pub fn skipped(incident: &Incident, now: DateTime<Utc>) -> Self {
        let mut report = Self::blank(incident, RcaStatus::Skipped, now);
        report.root_cause_summary = "AI RCA skipped: summarizer API key not configured.".to_string();
        report.recommended_fixes = vec!["Configure an API key to enable AI RCA.".to_string()];
        report
    }

    /// Report recorded when the summarizer call or its parsing failed.
    pub fn failed(incident: &Incident, error: &RcaError, now: DateTime<Utc>) -> Self {
        let mut report = Self::blank(incident, RcaStatus::Failed, now);
        report.root_cause_summary = format!("Failed to generate AI RCA report: {error}");
        report
    }
}

/// External narrative generator.
#[async_trait::async_trait]
pub trait RcaGenerator: Send + Sync {
    /// Produce a report for `incident`. Errors become FAILED reports.
    async fn generate(&self, incident: &Incident, evidence: &[Evidence]) -> Result<RcaReport, RcaError>;
}
