//! In-process store, used for tests and `database = ":memory:"`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use super::{
    Collection, ComponentStore, ETag, ItemUpdate, NewItem, StoredItem, check_etag,
};
use crate::error::{CalCardError, CalCardResult};
use crate::sync::{CTag, ChangeKind, ChangeRecord, ChangeSet, SyncToken, TokenState, select_changes};
use crate::time_range::TimeRange;

#[derive(Default)]
struct State {
    collections: HashMap<String, Collection>,
    items: HashMap<String, StoredItem>,
    changes: HashMap<String, Vec<ChangeRecord>>,
    next_change_id: i64,
}

impl State {
    fn collection_mut(&mut self, id: &str) -> CalCardResult<&mut Collection> {
        self.collections
            .get_mut(id)
            .ok_or_else(|| CalCardError::not_found("Calendar", id))
    }

    fn item(&self, uuid: &str) -> CalCardResult<&StoredItem> {
        self.items
            .get(uuid)
            .ok_or_else(|| CalCardError::not_found("Event", uuid))
    }

    fn uid_taken(&self, collection_id: &str, uid: &str) -> bool {
        self.items
            .values()
            .any(|i| i.collection_id == collection_id && i.uid == uid)
    }

    /// Append one record per kind and advance the collection's token and CTag.
    fn record_changes(
        &mut self,
        collection_id: &str,
        path: &str,
        uid: &str,
        kinds: &[ChangeKind],
    ) -> CalCardResult<()> {
        let now = Utc::now();
        let mut token = self.collection_mut(collection_id)?.sync_token.clone();
        for kind in kinds {
            token = SyncToken::issue(Some(&token));
            self.next_change_id += 1;
            self.changes
                .entry(collection_id.to_string())
                .or_default()
                .push(ChangeRecord {
                    id: self.next_change_id,
                    collection_id: collection_id.to_string(),
                    resource_path: path.to_string(),
                    resource_uid: uid.to_string(),
                    kind: *kind,
                    token: token.clone(),
                    created_at: now,
                });
        }

        let collection = self.collection_mut(collection_id)?;
        collection.sync_token = token;
        collection.ctag = CTag::fresh();
        collection.updated_at = now;
        Ok(())
    }
}

/// Store keeping everything behind one lock; a write holds it for the item,
/// its change records and the token bump together.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ComponentStore for MemoryStore {
    async fn create_collection(&self, collection: Collection) -> CalCardResult<Collection> {
        let mut state = self.lock();
        if state.collections.contains_key(&collection.id) {
            return Err(CalCardError::Conflict(collection.id));
        }
        state
            .collections
            .insert(collection.id.clone(), collection.clone());
        info!(id = %collection.id, name = %collection.name, "Created calendar");
        Ok(collection)
    }

    async fn get_collection(&self, id: &str) -> CalCardResult<Collection> {
        self.lock()
            .collections
            .get(id)
            .cloned()
            .ok_or_else(|| CalCardError::not_found("Calendar", id))
    }

    async fn list_collections(&self) -> CalCardResult<Vec<Collection>> {
        let mut collections: Vec<Collection> = self.lock().collections.values().cloned().collect();
        collections.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(collections)
    }

    async fn get_item(&self, uuid: &str) -> CalCardResult<StoredItem> {
        self.lock().item(uuid).cloned()
    }

    async fn get_item_by_path(&self, collection_id: &str, path: &str) -> CalCardResult<StoredItem> {
        self.lock()
            .items
            .values()
            .find(|i| i.collection_id == collection_id && i.path == path)
            .cloned()
            .ok_or_else(|| CalCardError::not_found("Event", path))
    }

    async fn list_items(
        &self,
        collection_id: &str,
        range: Option<&TimeRange>,
    ) -> CalCardResult<Vec<StoredItem>> {
        let state = self.lock();
        if !state.collections.contains_key(collection_id) {
            return Err(CalCardError::not_found("Calendar", collection_id));
        }
        let mut items: Vec<StoredItem> = state
            .items
            .values()
            .filter(|i| i.collection_id == collection_id)
            .filter(|i| range.is_none_or(|r| i.projection.may_overlap(r)))
            .cloned()
            .collect();
        items.sort_by(|a, b| (a.projection.start, &a.uuid).cmp(&(b.projection.start, &b.uuid)));
        Ok(items)
    }

    async fn create_item(&self, collection_id: &str, item: NewItem) -> CalCardResult<StoredItem> {
        let mut state = self.lock();
        state.collection_mut(collection_id)?;
        if state.uid_taken(collection_id, &item.uid) {
            return Err(CalCardError::Conflict(item.uid));
        }

        let now = Utc::now();
        let stored = StoredItem {
            etag: ETag::of(&item.ics),
            uuid: item.uuid,
            uid: item.uid,
            collection_id: collection_id.to_string(),
            path: item.path,
            ics: item.ics,
            projection: item.projection,
            created_at: now,
            updated_at: now,
        };
        state.record_changes(collection_id, &stored.path, &stored.uid, &[ChangeKind::Created])?;
        state.items.insert(stored.uuid.clone(), stored.clone());
        Ok(stored)
    }

    async fn update_item(
        &self,
        uuid: &str,
        update: ItemUpdate,
        expected: Option<&ETag>,
    ) -> CalCardResult<StoredItem> {
        let mut state = self.lock();
        let mut item = state.item(uuid)?.clone();
        check_etag(uuid, &item.etag, expected)?;

        item.etag = ETag::of(&update.ics);
        item.ics = update.ics;
        item.projection = update.projection;
        item.updated_at = Utc::now();

        state.record_changes(&item.collection_id, &item.path, &item.uid, &update.changes)?;
        state.items.insert(item.uuid.clone(), item.clone());
        Ok(item)
    }

    async fn delete_item(&self, uuid: &str, expected: Option<&ETag>) -> CalCardResult<()> {
        let mut state = self.lock();
        let item = state.item(uuid)?.clone();
        check_etag(uuid, &item.etag, expected)?;

        state.record_changes(&item.collection_id, &item.path, &item.uid, &[ChangeKind::Deleted])?;
        state.items.remove(uuid);
        Ok(())
    }

    async fn move_item(&self, uuid: &str, target_collection_id: &str) -> CalCardResult<StoredItem> {
        let mut state = self.lock();
        let mut item = state.item(uuid)?.clone();
        state.collection_mut(target_collection_id)?;
        if item.collection_id == target_collection_id {
            return Ok(item);
        }
        if state.uid_taken(target_collection_id, &item.uid) {
            return Err(CalCardError::Conflict(item.uid));
        }

        let source = std::mem::replace(&mut item.collection_id, target_collection_id.to_string());
        item.updated_at = Utc::now();
        state.record_changes(&source, &item.path, &item.uid, &[ChangeKind::Deleted])?;
        state.record_changes(target_collection_id, &item.path, &item.uid, &[ChangeKind::Created])?;
        state.items.insert(item.uuid.clone(), item.clone());
        Ok(item)
    }

    async fn changes_since(&self, collection_id: &str, since: Option<&str>) -> CalCardResult<ChangeSet> {
        let state = self.lock();
        let collection = state
            .collections
            .get(collection_id)
            .ok_or_else(|| CalCardError::not_found("Calendar", collection_id))?;
        let log = state.changes.get(collection_id).map(Vec::as_slice).unwrap_or_default();

        let records = select_changes(
            log,
            TokenState {
                current: &collection.sync_token,
                floor: &collection.floor_token,
            },
            since,
        )?;
        Ok(ChangeSet {
            records,
            token: collection.sync_token.clone(),
        })
    }

    async fn prune_changes(&self, collection_id: &str, older_than: DateTime<Utc>) -> CalCardResult<usize> {
        let mut state = self.lock();
        state.collection_mut(collection_id)?;

        let log = state.changes.entry(collection_id.to_string()).or_default();
        let split = log.partition_point(|r| r.created_at < older_than);
        let pruned: Vec<ChangeRecord> = log.drain(..split).collect();

        if let Some(newest) = pruned.last() {
            let floor = newest.token.clone();
            state.collection_mut(collection_id)?.floor_token = floor;
            info!(collection = collection_id, pruned = pruned.len(), "Pruned change log");
        }
        Ok(pruned.len())
    }
}
