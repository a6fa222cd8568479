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

        CREATE TABLE IF NOT EXISTS test_port (
            id INTEGER PRIMARY KEY,
            execution_id TEXT NOT NULL,
            selenium_port INTEGER NOT NULL,
            vnc_port INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS stop_execution (
            execution_id TEXT PRIMARY KEY,
            requested_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS evidence_file (
            evidence_id TEXT PRIMARY KEY,
            file_name TEXT NOT NULL,
            evidence_uri TEXT NOT NULL,
            type_id INTEGER NOT NULL,
            test_execution_id TEXT NOT NULL,
            case_execution_id TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (test_execution_id, case_execution_id, file_name)
        );

        CREATE TABLE IF NOT EXISTS evidence_text (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            evidence_id TEXT NOT NULL REFERENCES evidence_file(evidence_id),
            evidence_text TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS test_execution (
            execution_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            case_count INTEGER,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS event_outbox (
            id INTEGER PRIMARY KEY,
            channel TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            dispatched INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_test_port_execution ON test_port(execution_id);
        CREATE INDEX IF NOT EXISTS idx_evidence_file_execution ON evidence_file(test_execution_id);
        CREATE INDEX IF NOT EXISTS idx_evidence_text_evidence ON evidence_text(evidence_id);
        CREATE INDEX IF NOT EXISTS idx_event_outbox_pending ON event_outbox(dispatched, id);",
    )?;

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
            "test_port",
            "stop_execution",
            "evidence_file",
            "evidence_text",
            "test_execution",
            "event_outbox",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "table {table} should start empty");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }
}
