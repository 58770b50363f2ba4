//! SQLite schema migrations for the component store.

use rusqlite::{Connection, types::Type};

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 2;

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS calendars (
    id          TEXT PRIMARY KEY,
    path        TEXT NOT NULL,
    name        TEXT NOT NULL,
    description TEXT,
    color       TEXT NOT NULL,
    timezone    TEXT NOT NULL,
    sync_token  TEXT NOT NULL,
    ctag        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS calendar_objects (
    uuid         TEXT PRIMARY KEY,
    calendar_id  TEXT NOT NULL REFERENCES calendars(id) ON DELETE CASCADE,
    path         TEXT NOT NULL,
    uid          TEXT NOT NULL,
    etag         TEXT NOT NULL,
    ical_data    TEXT NOT NULL,
    summary      TEXT,
    description  TEXT,
    location     TEXT,
    start_time   TEXT,
    end_time     TEXT,
    is_all_day   INTEGER NOT NULL DEFAULT 0,
    is_recurring INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    UNIQUE (calendar_id, uid),
    UNIQUE (calendar_id, path)
);

CREATE INDEX IF NOT EXISTS idx_calendar_objects_start
    ON calendar_objects (calendar_id, start_time);

CREATE TABLE IF NOT EXISTS sync_change_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    calendar_id   TEXT NOT NULL REFERENCES calendars(id) ON DELETE CASCADE,
    resource_path TEXT NOT NULL,
    resource_uid  TEXT NOT NULL,
    change_type   TEXT NOT NULL,
    sync_token    TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_change_log_calendar
    ON sync_change_log (calendar_id, id);
CREATE INDEX IF NOT EXISTS idx_sync_change_log_token
    ON sync_change_log (calendar_id, sync_token);
"#;

/// Pruning support: the oldest checkpoint a calendar still answers.
const MIGRATION_V2_SQL: &str = r#"
ALTER TABLE calendars ADD COLUMN floor_token TEXT NOT NULL DEFAULT '';
UPDATE calendars SET floor_token = sync_token WHERE floor_token = '';
CREATE INDEX IF NOT EXISTS idx_sync_change_log_created
    ON sync_change_log (calendar_id, created_at);
"#;

const MIGRATIONS: &[(u32, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

/// Read `PRAGMA user_version` and convert it to a Rust `u32`.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Apply all pending migrations in ascending order, each in its own transaction.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let mut current = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.commit()?;
        current = *version;
    }

    Ok(current)
}
