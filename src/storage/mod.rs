//! SQLite storage layer -- schema, queries, migrations.

pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::detect::baseline::Baseline;
use crate::detect::schema::SchemaRecord;
use crate::detect::{Evidence, EvidenceKind, Incident, IncidentStatus, IncidentType, Severity};
use crate::intake::EndpointKey;
use crate::metrics::Granularity;
use crate::rca::{RcaReport, RcaStatus};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager).with_context(|| format!("failed to open database {path}"))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Outcome of an operator status change.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(Incident),
    NotFound,
    /// The incident is in a state the transition does not start from.
    Conflict(Incident),
}

/// Typed access to baselines, schema history, incidents and RCA reports.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

impl Store {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    // ── Baselines ──────────────────────────────────────────────────

    pub fn get_baseline(&self, endpoint: &EndpointKey, granularity: Granularity) -> Result<Option<Baseline>> {
        let conn = self.pool.get()?;
        let baseline = conn
            .query_row(
                "SELECT endpoint, granularity, error_rate_pct, p50_ms, p95_ms, p99_ms, request_count, last_computed
                 FROM endpoint_baselines WHERE endpoint = ?1 AND granularity = ?2",
                params![endpoint.as_str(), granularity.as_str()],
                baseline_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load {granularity} baseline for {endpoint}"))?;
        Ok(baseline)
    }

    pub fn put_baseline(&self, b: &Baseline) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO endpoint_baselines
                (endpoint, granularity, error_rate_pct, p50_ms, p95_ms, p99_ms, request_count, last_computed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(endpoint, granularity) DO UPDATE SET
                error_rate_pct = excluded.error_rate_pct,
                p50_ms = excluded.p50_ms,
                p95_ms = excluded.p95_ms,
                p99_ms = excluded.p99_ms,
                request_count = excluded.request_count,
                last_computed = excluded.last_computed",
            params![
                b.endpoint.as_str(),
                b.granularity.as_str(),
                b.error_rate_pct,
                to_i64(b.p50_ms),
                to_i64(b.p95_ms),
                to_i64(b.p99_ms),
                to_i64(b.request_count),
                fmt_ts(b.last_computed),
            ],
        )
        .with_context(|| format!("failed to store {} baseline for {}", b.granularity, b.endpoint))?;
        Ok(())
    }

    // ── Schema history ─────────────────────────────────────────────

    pub fn latest_schema(&self, endpoint: &EndpointKey) -> Result<Option<SchemaRecord>> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                "SELECT endpoint, fingerprint, version, breaking_change, first_seen, last_seen
                 FROM schema_versions WHERE endpoint = ?1
                 ORDER BY version DESC LIMIT 1",
                params![endpoint.as_str()],
                schema_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load latest schema for {endpoint}"))?;
        Ok(record)
    }

    pub fn append_schema(&self, record: &SchemaRecord) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO schema_versions (endpoint, fingerprint, version, breaking_change, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.endpoint.as_str(),
                record.fingerprint,
                record.version,
                record.breaking_change,
                fmt_ts(record.first_seen),
                fmt_ts(record.last_seen),
            ],
        )
        .with_context(|| format!("failed to append schema v{} for {}", record.version, record.endpoint))?;
        Ok(())
    }

    pub fn touch_schema(&self, endpoint: &EndpointKey, version: u32, last_seen: DateTime<Utc>) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE schema_versions SET last_seen = ?3 WHERE endpoint = ?1 AND version = ?2",
            params![endpoint.as_str(), version, fmt_ts(last_seen)],
        )
        .with_context(|| format!("failed to touch schema v{version} for {endpoint}"))?;
        Ok(())
    }

    /// All versions for an endpoint, oldest first.
    pub fn schema_history(&self, endpoint: &EndpointKey) -> Result<Vec<SchemaRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT endpoint, fingerprint, version, breaking_change, first_seen, last_seen
             FROM schema_versions WHERE endpoint = ?1 ORDER BY version ASC",
        )?;
        let rows = stmt
            .query_map(params![endpoint.as_str()], schema_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Incidents ──────────────────────────────────────────────────

    /// Insert `incident` and its evidence unless an OPEN incident of the same
    /// endpoint and type was detected in `[since, incident.detected_at]`.
    ///
    /// Returns false when suppressed. Check and insert share one write
    /// transaction, so concurrent callers cannot both pass the check.
    pub fn insert_incident_deduped(&self, incident: &Incident, evidence: &Evidence, since: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM incidents
             WHERE endpoint = ?1 AND incident_type = ?2 AND status = 'OPEN'
               AND detected_at >= ?3 AND detected_at <= ?4",
            params![
                incident.endpoint.as_str(),
                incident.kind.as_str(),
                fmt_ts(since),
                fmt_ts(incident.detected_at),
            ],
            |row| row.get(0),
        )?;
        if existing > 0 {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO incidents
                (id, endpoint, incident_type, severity, status, detected_at, triggered_at, acknowledged_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                incident.id.to_string(),
                incident.endpoint.as_str(),
                incident.kind.as_str(),
                incident.severity.as_str(),
                incident.status.as_str(),
                fmt_ts(incident.detected_at),
                fmt_ts(incident.triggered_at),
                incident.acknowledged_at.map(fmt_ts),
                incident.resolved_at.map(fmt_ts),
            ],
        )
        .context("failed to insert incident")?;

        tx.execute(
            "INSERT INTO incident_evidence (id, incident_id, evidence_type, data_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                evidence.id.to_string(),
                evidence.incident_id.to_string(),
                evidence.kind.as_str(),
                evidence.data.to_string(),
                fmt_ts(evidence.created_at),
            ],
        )
        .context("failed to insert incident evidence")?;

        tx.commit()?;
        Ok(true)
    }

    pub fn get_incident(&self, id: Uuid) -> Result<Option<Incident>> {
        let conn = self.pool.get()?;
        let incident = conn
            .query_row(
                &format!("{INCIDENT_SELECT} WHERE id = ?1"),
                params![id.to_string()],
                incident_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load incident {id}"))?;
        Ok(incident)
    }

    /// Incidents newest first, optionally filtered.
    pub fn list_incidents(&self, status: Option<IncidentStatus>, kind: Option<IncidentType>) -> Result<Vec<Incident>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "{INCIDENT_SELECT}
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR incident_type = ?2)
             ORDER BY detected_at DESC"
        ))?;
        let rows = stmt
            .query_map(
                params![status.map(|s| s.as_str()), kind.map(|k| k.as_str())],
                incident_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn evidence_for(&self, incident_id: Uuid) -> Result<Vec<Evidence>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, evidence_type, data_json, created_at
             FROM incident_evidence WHERE incident_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![incident_id.to_string()], evidence_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// OPEN -> ACKNOWLEDGED.
    pub fn acknowledge_incident(&self, id: Uuid, at: DateTime<Utc>) -> Result<Transition> {
        self.transition(id, |incident| {
            if incident.status != IncidentStatus::Open {
                return false;
            }
            incident.status = IncidentStatus::Acknowledged;
            incident.acknowledged_at = Some(at);
            true
        })
    }

    /// Any state -> RESOLVED.
    pub fn resolve_incident(&self, id: Uuid, at: DateTime<Utc>) -> Result<Transition> {
        self.transition(id, |incident| {
            incident.status = IncidentStatus::Resolved;
            incident.resolved_at = Some(at);
            true
        })
    }

    fn transition(&self, id: Uuid, apply: impl FnOnce(&mut Incident) -> bool) -> Result<Transition> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                &format!("{INCIDENT_SELECT} WHERE id = ?1"),
                params![id.to_string()],
                incident_from_row,
            )
            .optional()?;
        let Some(mut incident) = current else {
            return Ok(Transition::NotFound);
        };
        if !apply(&mut incident) {
            return Ok(Transition::Conflict(incident));
        }

        tx.execute(
            "UPDATE incidents SET status = ?2, acknowledged_at = ?3, resolved_at = ?4 WHERE id = ?1",
            params![
                id.to_string(),
                incident.status.as_str(),
                incident.acknowledged_at.map(fmt_ts),
                incident.resolved_at.map(fmt_ts),
            ],
        )
        .with_context(|| format!("failed to update incident {id}"))?;
        tx.commit()?;
        Ok(Transition::Applied(incident))
    }

    // ── RCA reports ────────────────────────────────────────────────

    /// Insert or replace the report for its incident.
    pub fn save_rca_report(&self, r: &RcaReport) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO rca_reports
                (id, incident_id, status, root_cause_summary, likely_trigger, affected_endpoints_json,
                 severity_reason, recommended_fixes_json, rollback_or_patch, confidence, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(incident_id) DO UPDATE SET
                status = excluded.status,
                root_cause_summary = excluded.root_cause_summary,
                likely_trigger = excluded.likely_trigger,
                affected_endpoints_json = excluded.affected_endpoints_json,
                severity_reason = excluded.severity_reason,
                recommended_fixes_json = excluded.recommended_fixes_json,
                rollback_or_patch = excluded.rollback_or_patch,
                confidence = excluded.confidence,
                updated_at = excluded.updated_at",
            params![
                r.id.to_string(),
                r.incident_id.to_string(),
                r.status.as_str(),
                r.root_cause_summary,
                r.likely_trigger,
                serde_json::to_string(&r.affected_endpoints)?,
                r.severity_reason,
                serde_json::to_string(&r.recommended_fixes)?,
                r.rollback_or_patch,
                r.confidence,
                fmt_ts(r.created_at),
                fmt_ts(r.updated_at),
            ],
        )
        .with_context(|| format!("failed to store RCA report for incident {}", r.incident_id))?;
        Ok(())
    }

    pub fn rca_report(&self, incident_id: Uuid) -> Result<Option<RcaReport>> {
        let conn = self.pool.get()?;
        let report = conn
            .query_row(
                "SELECT id, incident_id, status, root_cause_summary, likely_trigger, affected_endpoints_json,
                        severity_reason, recommended_fixes_json, rollback_or_patch, confidence, created_at, updated_at
                 FROM rca_reports WHERE incident_id = ?1",
                params![incident_id.to_string()],
                rca_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load RCA report for incident {incident_id}"))?;
        Ok(report)
    }
}

const INCIDENT_SELECT: &str = "SELECT id, endpoint, incident_type, severity, status, detected_at, triggered_at,
        acknowledged_at, resolved_at FROM incidents";

/// Fixed-width UTC timestamp; string order equals time order.
pub fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{raw}': {e}")))
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(_) => ts_at(row, idx).map(Some),
    }
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, format!("bad uuid '{raw}': {e}")))
}

fn u64_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    Ok(u64::try_from(raw).unwrap_or(0))
}

fn parsed_at<T>(row: &Row<'_>, idx: usize, parse: impl FnOnce(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unknown value '{raw}'")))
}

fn json_at<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, format!("bad JSON: {e}")))
}

fn baseline_from_row(row: &Row<'_>) -> rusqlite::Result<Baseline> {
    Ok(Baseline {
        endpoint: EndpointKey::from_stored(row.get::<_, String>(0)?),
        granularity: parsed_at(row, 1, Granularity::parse)?,
        error_rate_pct: row.get(2)?,
        p50_ms: u64_at(row, 3)?,
        p95_ms: u64_at(row, 4)?,
        p99_ms: u64_at(row, 5)?,
        request_count: u64_at(row, 6)?,
        last_computed: ts_at(row, 7)?,
    })
}

fn schema_from_row(row: &Row<'_>) -> rusqlite::Result<SchemaRecord> {
    Ok(SchemaRecord {
        endpoint: EndpointKey::from_stored(row.get::<_, String>(0)?),
        fingerprint: row.get(1)?,
        version: row.get(2)?,
        breaking_change: row.get(3)?,
        first_seen: ts_at(row, 4)?,
        last_seen: ts_at(row, 5)?,
    })
}

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    Ok(Incident {
        id: uuid_at(row, 0)?,
        endpoint: EndpointKey::from_stored(row.get::<_, String>(1)?),
        kind: parsed_at(row, 2, IncidentType::parse)?,
        severity: parsed_at(row, 3, Severity::parse)?,
        status: parsed_at(row, 4, IncidentStatus::parse)?,
        detected_at: ts_at(row, 5)?,
        triggered_at: ts_at(row, 6)?,
        acknowledged_at: opt_ts_at(row, 7)?,
        resolved_at: opt_ts_at(row, 8)?,
    })
}

fn evidence_from_row(row: &Row<'_>) -> rusqlite::Result<Evidence> {
    Ok(Evidence {
        id: uuid_at(row, 0)?,
        incident_id: uuid_at(row, 1)?,
        kind: parsed_at(row, 2, EvidenceKind::parse)?,
        data: json_at(row, 3)?,
        created_at: ts_at(row, 4)?,
    })
}

fn rca_from_row(row: &Row<'_>) -> rusqlite::Result<RcaReport> {
    Ok(RcaReport {
        id: uuid_at(row, 0)?,
        incident_id: uuid_at(row, 1)?,
        status: parsed_at(row, 2, RcaStatus::parse)?,
        root_cause_summary: row.get(3)?,
        likely_trigger: row.get(4)?,
        affected_endpoints: json_at(row, 5)?,
        severity_reason: row.get(6)?,
        recommended_fixes: json_at(row, 7)?,
        rollback_or_patch: row.get(8)?,
        confidence: row.get(9)?,
        created_at: ts_at(row, 10)?,
        updated_at: ts_at(row, 11)?,
    })
}
