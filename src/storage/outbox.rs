//! Event outbox.
//!
//! Lifecycle events are written here first and forwarded to the broker by a
//! background dispatcher, so an unreachable broker delays delivery instead of
//! losing events. Delivery is at-least-once: a row is only marked after the
//! broker accepted it.

use anyhow::Result;
use rusqlite::params;

use super::Store;

/// One queued event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: i64,
    pub channel: String,
    pub payload_json: String,
}

impl Store {
    /// Queue a serialized event for `channel`.
    pub fn enqueue_event(&self, channel: &str, payload_json: &str) -> Result<()> {
        let conn = self.pool().get()?;
        conn.execute(
            "INSERT INTO event_outbox (channel, payload_json) VALUES (?1, ?2)",
            params![channel, payload_json],
        )?;
        Ok(())
    }

    /// Oldest undelivered events, up to `limit`.
    pub fn pending_events(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let conn = self.pool().get()?;
        let mut stmt = conn.prepare(
            "SELECT id, channel, payload_json FROM event_outbox
             WHERE dispatched = 0 ORDER BY id LIMIT ?1",
        )?;

        let rows: Vec<OutboxEntry> = stmt
            .query_map(params![limit as i64], |row| {
                Ok(OutboxEntry {
                    id: row.get(0)?,
                    channel: row.get(1)?,
                    payload_json: row.get(2)?,
                })
            })?
            .collect::<Result<_, _>>()?;

        Ok(rows)
    }

    pub fn mark_dispatched(&self, id: i64) -> Result<()> {
        let conn = self.pool().get()?;
        conn.execute(
            "UPDATE event_outbox SET dispatched = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}
