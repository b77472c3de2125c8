//! Dead-letter log for failed processing attempts.
//!
//! Append-only from the core's point of view: entries are written when a
//! processing callback fails and are read only by operators (`rollcall
//! dead-letters`). The table is capped at `max_entries`; the oldest rows are
//! evicted first.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rollcall_core::types::to_db_timestamp;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use crate::{db::init_db, error::Result};

/// Entry to append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeadLetter {
    /// What kind of work failed, e.g. `"event_processing"`.
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    /// Whatever the caller needs to retry by hand.
    pub payload: Value,
    pub error_message: String,
    /// Times the failed work item itself ran. Transport-level retries inside
    /// a single run are not included; they show up in the retry logs and
    /// breaker stats.
    pub attempts: u32,
}

/// A stored entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: i64,
    pub kind: String,
    pub timestamp: String,
    pub payload: Value,
    pub error_message: String,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct DeadLetterLog {
    conn: Arc<Mutex<Connection>>,
    max_entries: usize,
}

impl DeadLetterLog {
    pub fn new(conn: Connection, max_entries: usize) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_entries: max_entries.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry, then trim the log back to `max_entries`.
    pub fn append(&self, entry: &NewDeadLetter) -> Result<i64> {
        let payload = serde_json::to_string(&entry.payload)?;
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO dead_letters (kind, created_at, payload, error_message, attempts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                entry.kind,
                to_db_timestamp(entry.timestamp),
                payload,
                entry.error_message,
                entry.attempts,
            ],
        )?;
        let id = tx.last_insert_rowid();
        let evicted = tx.execute(
            "DELETE FROM dead_letters WHERE id NOT IN
               (SELECT id FROM dead_letters ORDER BY id DESC LIMIT ?1)",
            [self.max_entries as i64],
        )?;
        tx.commit()?;

        error!(
            dead_letter_id = id,
            kind = %entry.kind,
            attempts = entry.attempts,
            error = %entry.error_message,
            "dead-letter entry recorded"
        );
        if evicted > 0 {
            warn!(evicted, "dead-letter log full, oldest entries evicted");
        }
        Ok(id)
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, created_at, payload, error_message, attempts
             FROM dead_letters ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, u32>(5)?,
                ))
            })?
            .filter_map(|row| match row {
                Ok(row) => Some(row),
                Err(e) => {
                    warn!("skipping unreadable dead-letter row: {e}");
                    None
                }
            })
            .map(|(id, kind, timestamp, payload, error_message, attempts)| DeadLetter {
                id,
                kind,
                timestamp,
                payload: serde_json::from_str(&payload).unwrap_or(Value::String(payload)),
                error_message,
                attempts,
            })
            .collect();
        Ok(rows)
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
