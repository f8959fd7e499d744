//! Chat-completion backed RCA generator.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{RcaError, RcaGenerator, RcaReport, RcaStatus};
use crate::config::RcaConfig;
use crate::detect::{Evidence, Incident};
use crate::metrics::clock::Clock;

const SYSTEM_PROMPT: &str = "You are an expert API reliability engineer. Analyze the provided incident \
data and generate a root cause analysis report in JSON format.";

pub struct OpenAiGenerator {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    clock: Arc<dyn Clock>,
}

impl OpenAiGenerator {
    pub fn new(config: &RcaConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("failed to build HTTP client for RCA generator")?;
        Ok(Self {
            client,
            api_key: config.api_key.trim().to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            clock,
        })
    }

    async fn complete(&self, prompt: String) -> Result<String, RcaError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "response_format": {"type": "json_object"},
            "temperature": 0.7,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(RcaError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl RcaGenerator for OpenAiGenerator {
    async fn generate(&self, incident: &Incident, evidence: &[Evidence]) -> Result<RcaReport, RcaError> {
        if self.api_key.is_empty() {
            warn!(incident_id = %incident.id, "no API key configured, skipping AI RCA");
            return Ok(RcaReport::skipped(incident, self.clock.now()));
        }

        let prompt = build_prompt(incident, evidence);
        debug!(incident_id = %incident.id, %prompt, "requesting RCA");
        let raw = self.complete(prompt).await?;
        let content = completion_content(&raw)?;
        report_from_content(incident, &content, self.clock.now())
    }
}

pub fn build_prompt(incident: &Incident, evidence: &[Evidence]) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "Analyze the incident data and evidence below and produce a concise, actionable root cause analysis.\n\
         Focus on metric deltas and schema changes.\n\n",
    );

    let _ = writeln!(prompt, "Incident Summary:");
    let _ = writeln!(prompt, "- Incident ID: {}", incident.id);
    let _ = writeln!(prompt, "- Endpoint: {}", incident.endpoint);
    let _ = writeln!(prompt, "- Type: {}", incident.kind);
    let _ = writeln!(prompt, "- Severity: {}", incident.severity);
    let _ = writeln!(prompt, "- Detected At: {}", incident.detected_at.to_rfc3339());
    let _ = writeln!(prompt, "- Status: {}\n", incident.status);

    if evidence.is_empty() {
        prompt.push_str("No specific evidence found for this incident.\n");
    } else {
        prompt.push_str("Detailed Evidence:\n");
        for item in evidence {
            let _ = writeln!(
                prompt,
                "--- Evidence Type: {} (Created: {}) ---",
                item.kind.as_str(),
                item.created_at.to_rfc3339()
            );
            let data = serde_json::to_string_pretty(&item.data).unwrap_or_else(|_| item.data.to_string());
            let _ = writeln!(prompt, "{data}");
        }
    }

    prompt.push_str(
        "\nRespond with a single JSON object with exactly these keys:\n\
         {\n\
         \x20 \"root_cause_summary\": string,\n\
         \x20 \"likely_trigger\": string,\n\
         \x20 \"affected_endpoints\": [string],\n\
         \x20 \"severity_reason\": string,\n\
         \x20 \"recommended_fixes\": [string],\n\
         \x20 \"rollback_vs_patch_recommendation\": \"ROLLBACK\" | \"PATCH\" | \"N/A\",\n\
         \x20 \"confidence\": number between 0 and 1\n\
         }\n\
         Do not include any text outside the JSON object.",
    );
    prompt
}

#[derive(Debug, Deserialize)]
struct Completion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

/// Extract the first choice's message content from a chat-completion body.
pub fn completion_content(raw: &str) -> Result<String, RcaError> {
    let completion: Completion = serde_json::from_str(raw)?;
    completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or(RcaError::MissingContent)
}

/// The model's answer. Fields stay loosely typed; see `text_of` and `list_of`.
#[derive(Debug, Default, Deserialize)]
struct RcaPayload {
    root_cause_summary: Option<Value>,
    likely_trigger: Option<Value>,
    affected_endpoints: Option<Value>,
    severity_reason: Option<Value>,
    recommended_fixes: Option<Value>,
    rollback_vs_patch_recommendation: Option<Value>,
    confidence: Option<Value>,
}

fn strip_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Text of a scalar field. Numbers and booleans are rendered, null counts as absent.
fn text_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Elements of a list field as text. Anything but an array counts as absent.
fn list_of(value: Option<&Value>) -> Option<Vec<String>> {
    match value? {
        Value::Array(items) => Some(items.iter().map(|item| text_of(Some(item)).unwrap_or_default()).collect()),
        _ => None,
    }
}

fn confidence_of(value: Option<&Value>) -> f64 {
    let raw = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    raw.filter(|c| c.is_finite()).unwrap_or(0.0).clamp(0.0, 1.0)
}

/// Map the model's JSON answer onto a GENERATED report.
pub fn report_from_content(
    incident: &Incident,
    content: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<RcaReport, RcaError> {
    let payload: RcaPayload = serde_json::from_str(strip_fence(content))?;
    let na = || "N/A".to_string();

    Ok(RcaReport {
        id: uuid::Uuid::new_v4(),
        incident_id: incident.id,
        status: RcaStatus::Generated,
        root_cause_summary: text_of(payload.root_cause_summary.as_ref()).unwrap_or_else(na),
        likely_trigger: text_of(payload.likely_trigger.as_ref()).unwrap_or_else(na),
        affected_endpoints: list_of(payload.affected_endpoints.as_ref())
            .unwrap_or_else(|| vec![incident.endpoint.to_string()]),
        severity_reason: text_of(payload.severity_reason.as_ref()).unwrap_or_else(na),
        recommended_fixes: list_of(payload.recommended_fixes.as_ref())
            .unwrap_or_else(|| vec!["No recommended fixes provided by AI.".to_string()]),
        rollback_or_patch: text_of(payload.rollback_vs_patch_recommendation.as_ref()).unwrap_or_else(na),
        confidence: confidence_of(payload.confidence.as_ref()),
        created_at: now,
        updated_at: now,
    })
}
