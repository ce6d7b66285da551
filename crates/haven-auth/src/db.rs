use rusqlite::Connection;

use crate::error::Result;

/// Initialise the principals table. Safe to call on every startup — uses
/// IF NOT EXISTS throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS principals (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            subject      TEXT NOT NULL UNIQUE,
            email        TEXT,
            display_name TEXT NOT NULL,
            role         TEXT NOT NULL DEFAULT 'user',
            active       INTEGER NOT NULL DEFAULT 1,
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_principals_subject
            ON principals(subject);",
    )?;
    Ok(())
}
