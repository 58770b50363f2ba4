//! SQLite-backed store.
//!
//! One connection behind a mutex; every operation runs on the blocking pool
//! and every write is a single transaction covering the item row, its change
//! records and the calendar's token/CTag bump.

mod migrations;

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, types::Type};
use tracing::{debug, info, warn};

use super::{
    Collection, ComponentStore, ETag, ItemUpdate, NewItem, Projection, StoredItem, check_etag,
};
use crate::error::{CalCardError, CalCardResult};
use crate::sync::{CTag, ChangeKind, ChangeRecord, ChangeSet, SyncToken, coalesce};
use crate::time_range::TimeRange;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COLLECTION_COLUMNS: &str = "id, path, name, description, color, timezone, \
     sync_token, floor_token, ctag, created_at, updated_at";

const ITEM_COLUMNS: &str = "uuid, uid, calendar_id, path, ical_data, etag, summary, \
     description, location, start_time, end_time, is_all_day, is_recurring, created_at, updated_at";

const CHANGE_COLUMNS: &str =
    "id, calendar_id, resource_path, resource_uid, change_type, sync_token, created_at";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and bring its schema
    /// up to date.
    pub fn open(path: &Path) -> CalCardResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn)?;
        info!(path = %path.display(), "Opened database");
        Ok(store)
    }

    pub fn open_in_memory() -> CalCardResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> CalCardResult<Self> {
        configure_connection(&conn)?;
        let version = migrations::migrate(&mut conn)?;
        debug!(version, "Schema up to date");
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> CalCardResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> CalCardResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| CalCardError::Io(std::io::Error::other(e)))?
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    // In-memory databases report "memory" and keep their mode.
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

/// Fixed-width UTC timestamps so that text comparison matches time order.
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(idx, &raw)
}

fn optional_timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| parse_timestamp(idx, &raw)).transpose()
}

fn collection_from_row(row: &Row<'_>) -> rusqlite::Result<Collection> {
    Ok(Collection {
        id: row.get(0)?,
        path: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        color: row.get(4)?,
        timezone: row.get(5)?,
        sync_token: SyncToken::from_raw(row.get::<_, String>(6)?),
        floor_token: SyncToken::from_raw(row.get::<_, String>(7)?),
        ctag: CTag::from_raw(row.get::<_, String>(8)?),
        created_at: timestamp_at(row, 9)?,
        updated_at: timestamp_at(row, 10)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<StoredItem> {
    Ok(StoredItem {
        uuid: row.get(0)?,
        uid: row.get(1)?,
        collection_id: row.get(2)?,
        path: row.get(3)?,
        ics: row.get(4)?,
        etag: ETag::parse(&row.get::<_, String>(5)?),
        projection: Projection {
            summary: row.get(6)?,
            description: row.get(7)?,
            location: row.get(8)?,
            start: optional_timestamp_at(row, 9)?,
            end: optional_timestamp_at(row, 10)?,
            all_day: row.get(11)?,
            recurring: row.get(12)?,
        },
        created_at: timestamp_at(row, 13)?,
        updated_at: timestamp_at(row, 14)?,
    })
}

fn change_from_row(row: &Row<'_>) -> rusqlite::Result<ChangeRecord> {
    let kind: String = row.get(4)?;
    Ok(ChangeRecord {
        id: row.get(0)?,
        collection_id: row.get(1)?,
        resource_path: row.get(2)?,
        resource_uid: row.get(3)?,
        kind: ChangeKind::parse(&kind)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        token: SyncToken::from_raw(row.get::<_, String>(5)?),
        created_at: timestamp_at(row, 6)?,
    })
}

fn fetch_collection(conn: &Connection, id: &str) -> CalCardResult<Collection> {
    conn.query_row(
        &format!("SELECT {COLLECTION_COLUMNS} FROM calendars WHERE id = ?1"),
        [id],
        collection_from_row,
    )
    .optional()?
    .ok_or_else(|| CalCardError::not_found("Calendar", id))
}

fn fetch_item(conn: &Connection, uuid: &str) -> CalCardResult<StoredItem> {
    conn.query_row(
        &format!("SELECT {ITEM_COLUMNS} FROM calendar_objects WHERE uuid = ?1"),
        [uuid],
        item_from_row,
    )
    .optional()?
    .ok_or_else(|| CalCardError::not_found("Event", uuid))
}

fn uid_taken(conn: &Connection, collection_id: &str, uid: &str) -> CalCardResult<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM calendar_objects WHERE calendar_id = ?1 AND uid = ?2)",
        params![collection_id, uid],
        |row| row.get(0),
    )?)
}

fn load_changes(conn: &Connection, collection_id: &str, after_id: i64) -> CalCardResult<Vec<ChangeRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHANGE_COLUMNS} FROM sync_change_log WHERE calendar_id = ?1 AND id > ?2 ORDER BY id"
    ))?;
    let records = stmt
        .query_map(params![collection_id, after_id], change_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// Append one record per kind and advance the calendar's token and CTag.
fn record_changes(
    tx: &Transaction<'_>,
    collection_id: &str,
    path: &str,
    uid: &str,
    kinds: &[ChangeKind],
) -> CalCardResult<()> {
    let now = Utc::now();
    let mut token = fetch_collection(tx, collection_id)?.sync_token;
    for kind in kinds {
        token = SyncToken::issue(Some(&token));
        tx.execute(
            "INSERT INTO sync_change_log (calendar_id, resource_path, resource_uid, change_type, sync_token, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![collection_id, path, uid, kind.as_str(), token.as_str(), timestamp(&now)],
        )?;
    }
    tx.execute(
        "UPDATE calendars SET sync_token = ?2, ctag = ?3, updated_at = ?4 WHERE id = ?1",
        params![collection_id, token.as_str(), CTag::fresh().as_str(), timestamp(&now)],
    )?;
    Ok(())
}

#[async_trait]
impl ComponentStore for SqliteStore {
    async fn create_collection(&self, collection: Collection) -> CalCardResult<Collection> {
        self.with_conn(move |conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM calendars WHERE id = ?1)",
                [&collection.id],
                |row| row.get(0),
            )?;
            if exists {
                return Err(CalCardError::Conflict(collection.id));
            }
            conn.execute(
                &format!("INSERT INTO calendars ({COLLECTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    collection.id,
                    collection.path,
                    collection.name,
                    collection.description,
                    collection.color,
                    collection.timezone,
                    collection.sync_token.as_str(),
                    collection.floor_token.as_str(),
                    collection.ctag.as_str(),
                    timestamp(&collection.created_at),
                    timestamp(&collection.updated_at),
                ],
            )?;
            info!(id = %collection.id, name = %collection.name, "Created calendar");
            Ok(collection)
        })
        .await
    }

    async fn get_collection(&self, id: &str) -> CalCardResult<Collection> {
        let id = id.to_string();
        self.with_conn(move |conn| fetch_collection(conn, &id)).await
    }

    async fn list_collections(&self) -> CalCardResult<Vec<Collection>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLLECTION_COLUMNS} FROM calendars ORDER BY created_at, id"
            ))?;
            let collections = stmt
                .query_map([], collection_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(collections)
        })
        .await
    }

    async fn get_item(&self, uuid: &str) -> CalCardResult<StoredItem> {
        let uuid = uuid.to_string();
        self.with_conn(move |conn| fetch_item(conn, &uuid)).await
    }

    async fn get_item_by_path(&self, collection_id: &str, path: &str) -> CalCardResult<StoredItem> {
        let collection_id = collection_id.to_string();
        let path = path.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM calendar_objects WHERE calendar_id = ?1 AND path = ?2"),
                params![collection_id, path],
                item_from_row,
            )
            .optional()?
            .ok_or_else(|| CalCardError::not_found("Event", path))
        })
        .await
    }

    async fn list_items(
        &self,
        collection_id: &str,
        range: Option<&TimeRange>,
    ) -> CalCardResult<Vec<StoredItem>> {
        let collection_id = collection_id.to_string();
        let range = range.copied();
        self.with_conn(move |conn| {
            fetch_collection(conn, &collection_id)?;
            // Coarse cut in SQL; the projection makes the final call.
            let before = range.as_ref().map(|r| timestamp(&r.end));
            let mut stmt = conn.prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM calendar_objects
                 WHERE calendar_id = ?1 AND (?2 IS NULL OR is_recurring = 1 OR start_time < ?2)
                 ORDER BY start_time, uuid"
            ))?;
            let items = stmt
                .query_map(params![collection_id, before], item_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(items
                .into_iter()
                .filter(|i| range.as_ref().is_none_or(|r| i.projection.may_overlap(r)))
                .collect())
        })
        .await
    }

    async fn create_item(&self, collection_id: &str, item: NewItem) -> CalCardResult<StoredItem> {
        let collection_id = collection_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            fetch_collection(&tx, &collection_id)?;
            if uid_taken(&tx, &collection_id, &item.uid)? {
                return Err(CalCardError::Conflict(item.uid));
            }

            let now = Utc::now();
            let stored = StoredItem {
                etag: ETag::of(&item.ics),
                uuid: item.uuid,
                uid: item.uid,
                collection_id,
                path: item.path,
                ics: item.ics,
                projection: item.projection,
                created_at: now,
                updated_at: now,
            };
            let p = &stored.projection;
            tx.execute(
                &format!("INSERT INTO calendar_objects ({ITEM_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"),
                params![
                    stored.uuid,
                    stored.uid,
                    stored.collection_id,
                    stored.path,
                    stored.ics,
                    stored.etag.as_str(),
                    p.summary,
                    p.description,
                    p.location,
                    p.start.as_ref().map(timestamp),
                    p.end.as_ref().map(timestamp),
                    p.all_day,
                    p.recurring,
                    timestamp(&stored.created_at),
                    timestamp(&stored.updated_at),
                ],
            )?;
            record_changes(&tx, &stored.collection_id, &stored.path, &stored.uid, &[ChangeKind::Created])?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn update_item(
        &self,
        uuid: &str,
        update: ItemUpdate,
        expected: Option<&ETag>,
    ) -> CalCardResult<StoredItem> {
        let uuid = uuid.to_string();
        let expected = expected.cloned();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut item = fetch_item(&tx, &uuid)?;
            check_etag(&uuid, &item.etag, expected.as_ref())?;

            item.etag = ETag::of(&update.ics);
            item.ics = update.ics;
            item.projection = update.projection;
            item.updated_at = Utc::now();

            let p = &item.projection;
            tx.execute(
                "UPDATE calendar_objects SET ical_data = ?2, etag = ?3, summary = ?4, description = ?5,
                 location = ?6, start_time = ?7, end_time = ?8, is_all_day = ?9, is_recurring = ?10,
                 updated_at = ?11
                 WHERE uuid = ?1",
                params![
                    item.uuid,
                    item.ics,
                    item.etag.as_str(),
                    p.summary,
                    p.description,
                    p.location,
                    p.start.as_ref().map(timestamp),
                    p.end.as_ref().map(timestamp),
                    p.all_day,
                    p.recurring,
                    timestamp(&item.updated_at),
                ],
            )?;
            record_changes(&tx, &item.collection_id, &item.path, &item.uid, &update.changes)?;
            tx.commit()?;
            Ok(item)
        })
        .await
    }

    async fn delete_item(&self, uuid: &str, expected: Option<&ETag>) -> CalCardResult<()> {
        let uuid = uuid.to_string();
        let expected = expected.cloned();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let item = fetch_item(&tx, &uuid)?;
            check_etag(&uuid, &item.etag, expected.as_ref())?;

            tx.execute("DELETE FROM calendar_objects WHERE uuid = ?1", [&uuid])?;
            record_changes(&tx, &item.collection_id, &item.path, &item.uid, &[ChangeKind::Deleted])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn move_item(&self, uuid: &str, target_collection_id: &str) -> CalCardResult<StoredItem> {
        let uuid = uuid.to_string();
        let target = target_collection_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut item = fetch_item(&tx, &uuid)?;
            fetch_collection(&tx, &target)?;
            if item.collection_id == target {
                return Ok(item);
            }
            if uid_taken(&tx, &target, &item.uid)? {
                return Err(CalCardError::Conflict(item.uid));
            }

            let source = std::mem::replace(&mut item.collection_id, target);
            item.updated_at = Utc::now();
            tx.execute(
                "UPDATE calendar_objects SET calendar_id = ?2, updated_at = ?3 WHERE uuid = ?1",
                params![item.uuid, item.collection_id, timestamp(&item.updated_at)],
            )?;
            record_changes(&tx, &source, &item.path, &item.uid, &[ChangeKind::Deleted])?;
            record_changes(&tx, &item.collection_id, &item.path, &item.uid, &[ChangeKind::Created])?;
            tx.commit()?;
            Ok(item)
        })
        .await
    }

    async fn changes_since(&self, collection_id: &str, since: Option<&str>) -> CalCardResult<ChangeSet> {
        let collection_id = collection_id.to_string();
        let since = since.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        self.with_conn(move |conn| {
            let collection = fetch_collection(conn, &collection_id)?;
            let empty = ChangeSet {
                records: Vec::new(),
                token: collection.sync_token.clone(),
            };
            let Some(since) = since else {
                return Ok(empty);
            };
            if since == collection.sync_token.as_str() {
                return Ok(empty);
            }

            let after_id = if since == collection.floor_token.as_str() {
                0
            } else {
                let checkpoint: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM sync_change_log WHERE calendar_id = ?1 AND sync_token = ?2",
                        params![collection_id, since],
                        |row| row.get(0),
                    )
                    .optional()?;
                match checkpoint {
                    Some(id) => id,
                    None => {
                        warn!(token = %since, "Unknown sync token");
                        return Err(CalCardError::InvalidSyncToken(since));
                    }
                }
            };

            Ok(ChangeSet {
                records: coalesce(load_changes(conn, &collection_id, after_id)?),
                token: collection.sync_token,
            })
        })
        .await
    }

    async fn prune_changes(&self, collection_id: &str, older_than: DateTime<Utc>) -> CalCardResult<usize> {
        let collection_id = collection_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            fetch_collection(&tx, &collection_id)?;

            let newest: Option<(i64, String)> = tx
                .query_row(
                    "SELECT id, sync_token FROM sync_change_log
                     WHERE calendar_id = ?1 AND created_at < ?2
                     ORDER BY id DESC LIMIT 1",
                    params![collection_id, timestamp(&older_than)],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((newest_id, floor)) = newest else {
                return Ok(0);
            };

            let pruned = tx.execute(
                "DELETE FROM sync_change_log WHERE calendar_id = ?1 AND id <= ?2",
                params![collection_id, newest_id],
            )?;
            tx.execute(
                "UPDATE calendars SET floor_token = ?2 WHERE id = ?1",
                params![collection_id, floor],
            )?;
            tx.commit()?;
            info!(collection = %collection_id, pruned, "Pruned change log");
            Ok(pruned)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::migrations::LATEST_SCHEMA_VERSION;
    use crate::store::tests as shared;
    use crate::store::NewCollection;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("data").join("calcard.sqlite3")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_item_lifecycle() {
        let (_dir, store) = open_temp();
        shared::exercise_item_lifecycle(&store).await;
    }

    #[tokio::test]
    async fn test_change_log() {
        let (_dir, store) = open_temp();
        shared::exercise_change_log(&store).await;
    }

    #[tokio::test]
    async fn test_split_records_two_changes() {
        let (_dir, store) = open_temp();
        shared::exercise_split_records_two_changes(&store).await;
    }

    #[tokio::test]
    async fn test_move() {
        let (_dir, store) = open_temp();
        shared::exercise_move(&store).await;
    }

    #[tokio::test]
    async fn test_list_range() {
        let (_dir, store) = open_temp();
        shared::exercise_list_range(&store).await;
    }

    #[tokio::test]
    async fn test_prune() {
        let (_dir, store) = open_temp();
        shared::exercise_prune(&store).await;
    }

    #[tokio::test]
    async fn test_reopen_keeps_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("calcard.sqlite3");

        let (cal, item) = {
            let store = SqliteStore::open(&path).unwrap();
            let cal = store
                .create_collection(
                    Collection::new(NewCollection {
                        name: "Persisted".into(),
                        ..Default::default()
                    })
                    .unwrap(),
                )
                .await
                .unwrap();
            let item = store.create_item(&cal.id, shared::new_item("p@test", None)).await.unwrap();
            (cal, item)
        };

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_item(&item.uuid).await.unwrap(), item);
        let reopened = store.get_collection(&cal.id).await.unwrap();
        assert_eq!(reopened.floor_token, cal.floor_token);
        let changes = store.changes_since(&cal.id, Some(cal.sync_token.as_str())).await.unwrap();
        assert_eq!(changes.records.len(), 1);
        assert_eq!(changes.token, reopened.sync_token);
    }

    #[tokio::test]
    async fn test_in_memory_store_is_migrated() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.list_collections().await.unwrap().is_empty());
        let version = store
            .with_conn(|conn| Ok(migrations::current_schema_version(conn)?))
            .await
            .unwrap();
        assert_eq!(version, LATEST_SCHEMA_VERSION);
    }
}
