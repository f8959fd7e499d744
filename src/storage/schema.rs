//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS endpoint_baselines (
            id INTEGER PRIMARY KEY,
            endpoint TEXT NOT NULL,
            granularity TEXT NOT NULL,
            error_rate_pct REAL NOT NULL,
            p50_ms INTEGER NOT NULL,
            p95_ms INTEGER NOT NULL,
            p99_ms INTEGER NOT NULL,
            request_count INTEGER NOT NULL,
            last_computed TEXT NOT NULL,
            UNIQUE (endpoint, granularity)
        );

        CREATE TABLE IF NOT EXISTS schema_versions (
            id INTEGER PRIMARY KEY,
            endpoint TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            version INTEGER NOT NULL,
            breaking_change INTEGER NOT NULL DEFAULT 0,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            UNIQUE (endpoint, version)
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            endpoint TEXT NOT NULL,
            incident_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'OPEN',
            detected_at TEXT NOT NULL,
            triggered_at TEXT NOT NULL,
            acknowledged_at TEXT,
            resolved_at TEXT
        );

        CREATE TABLE IF NOT EXISTS incident_evidence (
            id TEXT PRIMARY KEY,
            incident_id TEXT NOT NULL,
            evidence_type TEXT NOT NULL,
            data_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (incident_id) REFERENCES incidents(id)
        );

        CREATE TABLE IF NOT EXISTS rca_reports (
            id TEXT PRIMARY KEY,
            incident_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            root_cause_summary TEXT NOT NULL,
            likely_trigger TEXT NOT NULL,
            affected_endpoints_json TEXT NOT NULL,
            severity_reason TEXT NOT NULL,
            recommended_fixes_json TEXT NOT NULL,
            rollback_or_patch TEXT NOT NULL,
            confidence REAL NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (incident_id) REFERENCES incidents(id)
        );

        CREATE INDEX IF NOT EXISTS idx_incidents_dedup
            ON incidents(endpoint, incident_type, status, detected_at);
        CREATE INDEX IF NOT EXISTS idx_incidents_detected ON incidents(detected_at);
        CREATE INDEX IF NOT EXISTS idx_evidence_incident ON incident_evidence(incident_id);",
    )?;

    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in [
            "endpoint_baselines",
            "schema_versions",
            "incidents",
            "incident_evidence",
            "rca_reports",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table} should start empty");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_schema_versions_are_unique_per_endpoint() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let insert = "INSERT INTO schema_versions (endpoint, fingerprint, version, first_seen, last_seen)
                      VALUES ('get:/a', ?1, 1, 'x', 'x')";
        conn.execute(insert, ["fp1"]).unwrap();
        assert!(conn.execute(insert, ["fp2"]).is_err());
    }
}
