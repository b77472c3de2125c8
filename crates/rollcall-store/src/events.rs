use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rollcall_core::types::{to_db_timestamp, Event, EventStatus, NewEvent};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    db::init_db,
    error::{Result, StoreError},
};

/// Durable table of events with a strict `pending → processed` lifecycle.
///
/// Cheap to clone: all clones share one connection behind a mutex. Inserts
/// are "insert if absent" and never overwrite `name`/`start_date` once a row
/// exists.
#[derive(Clone)]
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

/// Row counts per status, for operator output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processed: u64,
}

impl EventStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert the event unless a row with the same id already exists.
    ///
    /// Returns `true` only when a new row was written.
    pub fn insert_if_absent(&self, event: &NewEvent) -> Result<bool> {
        let conn = self.lock();
        let inserted = insert_row(&conn, event)?;
        if inserted {
            debug!(event_id = %event.id, "event stored");
        }
        Ok(inserted)
    }

    /// Insert a batch of candidates inside a single transaction.
    ///
    /// Either every new row becomes visible or none does. Returns the number
    /// of rows actually inserted (already-known ids count as zero).
    pub fn insert_batch(&self, events: &[NewEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        for event in events {
            if insert_row(&tx, event)? {
                inserted += 1;
            }
        }
        tx.commit()?;
        info!(candidates = events.len(), inserted, "event batch committed");
        Ok(inserted)
    }

    /// Pending events starting strictly before `cutoff`, earliest first.
    pub fn list_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<Event>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, start_date, status FROM events
             WHERE status = 'pending' AND start_date < ?1
             ORDER BY start_date, id",
        )?;
        let rows: Vec<(String, String, String, String)> = stmt
            .query_map([to_db_timestamp(cutoff)], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let events = rows
            .into_iter()
            .filter_map(|(id, name, start, status)| match decode(id, name, &start, &status) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("skipping unreadable event row: {e}");
                    None
                }
            })
            .collect();
        Ok(events)
    }

    pub fn get(&self, id: &str) -> Result<Option<Event>> {
        let conn = self.lock();
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT id, name, start_date, status FROM events WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        row.map(|(id, name, start, status)| decode(id, name, &start, &status))
            .transpose()
    }

    /// Move an event to `processed`.
    ///
    /// Unconditional and idempotent: an already-processed or unknown id is a
    /// no-op, not an error. Returns `true` when this call made the transition.
    pub fn mark_processed(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        let now = to_db_timestamp(Utc::now());
        let n = conn.execute(
            "UPDATE events SET status = 'processed', processed_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            rusqlite::params![now, id],
        )?;
        if n == 0 {
            debug!(event_id = %id, "mark_processed was a no-op");
        } else {
            info!(event_id = %id, "event marked processed");
        }
        Ok(n > 0)
    }

    pub fn count_by_status(&self) -> Result<StatusCounts> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM events GROUP BY status")?;
        let mut counts = StatusCounts::default();
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, n) = row?;
            let n = u64::try_from(n).unwrap_or_default();
            match status.parse::<EventStatus>() {
                Ok(EventStatus::Pending) => counts.pending = n,
                Ok(EventStatus::Processed) => counts.processed = n,
                Err(e) => warn!("ignoring unknown status in counts: {e}"),
            }
        }
        Ok(counts)
    }
}

fn insert_row(conn: &Connection, event: &NewEvent) -> Result<bool> {
    let n = conn.execute(
        "INSERT OR IGNORE INTO events (id, name, start_date, status, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4)",
        rusqlite::params![
            event.id,
            event.name,
            to_db_timestamp(event.start_date),
            to_db_timestamp(Utc::now()),
        ],
    )?;
    Ok(n == 1)
}

fn decode(id: String, name: String, start: &str, status: &str) -> Result<Event> {
    let start_date = DateTime::parse_from_rfc3339(start)
        .map_err(|e| StoreError::CorruptRow {
            id: id.clone(),
            reason: format!("bad start_date {start:?}: {e}"),
        })?
        .with_timezone(&Utc);
    let status = status
        .parse::<EventStatus>()
        .map_err(|reason| StoreError::CorruptRow {
            id: id.clone(),
            reason,
        })?;
    Ok(Event {
        id,
        name,
        start_date,
        status,
    })
}
