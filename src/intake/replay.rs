//! NDJSON replay of captured telemetry through the normal intake path.

use std::io::BufRead;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use super::Intake;

/// Counts from one replay run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub accepted: u64,
    pub rejected: u64,
}

/// Feed every non-blank line of `reader` to `intake`.
pub fn replay_reader<R: BufRead>(intake: &Intake, reader: R) -> Result<ReplayReport> {
    let mut report = ReplayReport::default();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let outcome = serde_json::from_str::<Value>(&line)
            .map_err(super::IngestError::from)
            .and_then(|value| intake.ingest(value));
        match outcome {
            Ok(_) => report.accepted += 1,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping replay line");
                report.rejected += 1;
            }
        }
    }
    Ok(report)
}

pub fn replay_file(intake: &Intake, path: &Path) -> Result<ReplayReport> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open replay file: {}", path.display()))?;
    let report = replay_reader(intake, std::io::BufReader::new(file))?;
    info!(
        path = %path.display(),
        accepted = report.accepted,
        rejected = report.rejected,
        "replay finished"
    );
    Ok(report)
}
