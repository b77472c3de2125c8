use rusqlite::Connection;

use crate::error::Result;

/// Open a connection with the pragmas every rollcall connection uses.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

/// Initialise the rollcall schema in `conn`. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_events_table(conn)?;
    create_dead_letters_table(conn)?;
    Ok(())
}

/// `start_date` is RFC 3339 UTC at second precision, so the pending scan can
/// compare it as text.
fn create_events_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS events (
            id            TEXT NOT NULL PRIMARY KEY,
            name          TEXT NOT NULL,
            start_date    TEXT NOT NULL,
            status        TEXT NOT NULL DEFAULT 'pending'
                          CHECK (status IN ('pending', 'processed')),
            created_at    TEXT NOT NULL,
            processed_at  TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_events_pending
            ON events (status, start_date);
        ",
    )?;
    Ok(())
}

fn create_dead_letters_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS dead_letters (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            kind           TEXT    NOT NULL,
            created_at     TEXT    NOT NULL,
            payload        TEXT    NOT NULL,   -- JSON
            error_message  TEXT    NOT NULL,
            attempts       INTEGER NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('events', 'dead_letters')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn status_check_rejects_unknown_states() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let res = conn.execute(
            "INSERT INTO events (id, name, start_date, status, created_at)
             VALUES ('e1', 'x', '2026-01-01T00:00:00Z', 'running', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(res.is_err());
    }
}
