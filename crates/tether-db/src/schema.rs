use rusqlite::Connection;

use crate::preferences::{LEGACY_PREFERENCES_KEY, PREFERENCES_KEY};

/// Current schema version. Bump this when adding migrations.
const CURRENT_VERSION: i64 = 2;

pub fn initialize(conn: &Connection) -> rusqlite::Result<()> {
    // Create base tables (idempotent)
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;

    migrate(conn)?;
    Ok(())
}

pub fn current_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    let version = current_version(conn)?;

    if version < 1 {
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
            [1_i64],
        )?;
    }

    if version < 2 {
        // Migration v2: preferences moved from the old camelCase key.
        // The JSON itself is upgraded when it is loaded.
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) \
             SELECT ?1, value FROM settings WHERE key = ?2",
            [PREFERENCES_KEY, LEGACY_PREFERENCES_KEY],
        )?;
        conn.execute("DELETE FROM settings WHERE key = ?1", [LEGACY_PREFERENCES_KEY])?;

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
            [CURRENT_VERSION],
        )?;
    }

    Ok(())
}
