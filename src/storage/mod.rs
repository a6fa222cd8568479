//! SQLite bulletin board -- ports, stop flags, evidence, job status, outbox.
//!
//! Nothing here drives orchestration decisions on its own; the tables only
//! carry signals between the orchestrator, the intake API and downstream
//! consumers. Every statement binds its parameters.

pub mod evidence;
pub mod outbox;
pub mod schema;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::environment::PortPair;
use crate::job::JobStatus;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database dir {}", parent.display()))?;
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

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Port record as written when a browser container comes up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortRecord {
    pub execution_id: String,
    pub selenium_port: u16,
    pub vnc_port: u16,
}

/// Durable status row for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    pub execution_id: String,
    pub status: String,
    pub case_count: Option<i64>,
    pub updated_at: String,
}

/// Handle to the bulletin-board tables. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

impl Store {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Record the host ports of a job's browser container.
    pub fn record_ports(&self, execution_id: &str, ports: PortPair) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO test_port (execution_id, selenium_port, vnc_port) VALUES (?1, ?2, ?3)",
            params![execution_id, ports.selenium, ports.display],
        )
        .context("Failed to insert port record")?;
        Ok(())
    }

    /// Most recent port record for a job, if any.
    pub fn ports_for(&self, execution_id: &str) -> Result<Option<PortRecord>> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                "SELECT execution_id, selenium_port, vnc_port FROM test_port
                 WHERE execution_id = ?1 ORDER BY id DESC LIMIT 1",
                params![execution_id],
                |row| {
                    Ok(PortRecord {
                        execution_id: row.get(0)?,
                        selenium_port: row.get(1)?,
                        vnc_port: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Raise the stop flag for a job. Repeated requests are no-ops.
    pub fn request_stop(&self, execution_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT OR IGNORE INTO stop_execution (execution_id) VALUES (?1)",
            params![execution_id],
        )
        .context("Failed to record stop request")?;
        Ok(())
    }

    /// Point-in-time read of the stop flag.
    pub fn is_stopped(&self, execution_id: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM stop_execution WHERE execution_id = ?1",
                params![execution_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Upsert the durable status row of a job.
    pub fn record_status(
        &self,
        execution_id: &str,
        status: JobStatus,
        case_count: Option<usize>,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        let case_count = case_count.map(|c| c as i64);
        conn.execute(
            "INSERT INTO test_execution (execution_id, status, case_count, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(execution_id) DO UPDATE SET
                status = excluded.status,
                case_count = COALESCE(excluded.case_count, test_execution.case_count),
                updated_at = excluded.updated_at",
            params![execution_id, status.as_str(), case_count],
        )
        .context("Failed to record job status")?;
        Ok(())
    }

    pub fn status_for(&self, execution_id: &str) -> Result<Option<StatusRecord>> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                "SELECT execution_id, status, case_count, updated_at FROM test_execution
                 WHERE execution_id = ?1",
                params![execution_id],
                |row| {
                    Ok(StatusRecord {
                        execution_id: row.get(0)?,
                        status: row.get(1)?,
                        case_count: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::temp_store;
    use super::*;

    #[test]
    fn test_stop_flag_is_idempotent() {
        let (_dir, store) = temp_store();
        assert!(!store.is_stopped("ex-1").unwrap());

        store.request_stop("ex-1").unwrap();
        store.request_stop("ex-1").unwrap();

        assert!(store.is_stopped("ex-1").unwrap());
        assert!(!store.is_stopped("ex-2").unwrap());
    }

    #[test]
    fn test_ports_round_trip() {
        let (_dir, store) = temp_store();
        assert!(store.ports_for("ex-1").unwrap().is_none());

        store
            .record_ports(
                "ex-1",
                PortPair {
                    selenium: 4446,
                    display: 5902,
                },
            )
            .unwrap();

        let rec = store.ports_for("ex-1").unwrap().unwrap();
        assert_eq!(rec.selenium_port, 4446);
        assert_eq!(rec.vnc_port, 5902);
    }

    #[test]
    fn test_status_upsert_keeps_case_count() {
        let (_dir, store) = temp_store();
        store
            .record_status("ex-1", JobStatus::Running, Some(3))
            .unwrap();
        store.record_status("ex-1", JobStatus::Failed, None).unwrap();

        let rec = store.status_for("ex-1").unwrap().unwrap();
        assert_eq!(rec.status, "failed");
        assert_eq!(rec.case_count, Some(3));
    }

    #[test]
    fn test_untrusted_ids_are_bound_not_interpolated() {
        let (_dir, store) = temp_store();
        let hostile = "x'; DROP TABLE stop_execution; --";
        store.request_stop(hostile).unwrap();
        assert!(store.is_stopped(hostile).unwrap());
        assert!(!store.is_stopped("x").unwrap());
    }
}
