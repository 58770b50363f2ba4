//! Component Store: collections, items and the per-collection change log.
//!
//! A store exclusively owns persisted bytes. Every write commits the item
//! row, its change record(s) and the collection's token/CTag bump as one
//! unit, so a client can never observe a token without the change behind it.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::error::{CalCardError, CalCardResult};
use crate::event::{EventTime, Payload};
use crate::sync::{CTag, ChangeKind, ChangeSet, SyncToken};
use crate::time_range::TimeRange;

const PALETTE: &[&str] = &[
    "#3788d8", "#ff5733", "#28a745", "#ffc107", "#6f42c1", "#fd7e14", "#20c997", "#e83e8c",
];

/// A calendar collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collection {
    pub id: String,
    /// URL path component
    pub path: String,
    pub name: String,
    pub description: Option<String>,
    /// `#RRGGBB`
    pub color: String,
    pub timezone: String,
    pub sync_token: SyncToken,
    /// Oldest token `changes_since` still answers
    #[serde(skip)]
    pub floor_token: SyncToken,
    pub ctag: CTag,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a collection.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct NewCollection {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl Collection {
    /// Validate `new` and build a collection with a fresh token lineage.
    pub fn new(new: NewCollection) -> CalCardResult<Self> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(CalCardError::InvalidInput("name cannot be empty".into()));
        }
        if name.chars().count() > 255 {
            return Err(CalCardError::InvalidInput("name cannot exceed 255 characters".into()));
        }
        if new.description.as_ref().is_some_and(|d| d.chars().count() > 1000) {
            return Err(CalCardError::InvalidInput(
                "description cannot exceed 1000 characters".into(),
            ));
        }

        let color = match new.color {
            Some(color) if is_hex_color(&color) => color,
            Some(color) => {
                return Err(CalCardError::InvalidInput(format!(
                    "invalid color '{}', expected #RRGGBB",
                    color
                )));
            }
            None => PALETTE
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or("#3788d8")
                .to_string(),
        };

        let timezone = new.timezone.unwrap_or_else(|| "UTC".to_string());
        if timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(CalCardError::InvalidInput(format!("invalid timezone '{}'", timezone)));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let mut path = slug::slugify(&name);
        if path.is_empty() {
            path = id.clone();
        }

        let token = SyncToken::issue(None);
        let now = Utc::now();
        Ok(Collection {
            id,
            path,
            name,
            description: new.description.filter(|d| !d.is_empty()),
            color,
            timezone,
            floor_token: token.clone(),
            sync_token: token,
            ctag: CTag::fresh(),
            created_at: now,
            updated_at: now,
        })
    }
}

fn is_hex_color(color: &str) -> bool {
    color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Entity tag: a content hash of the stored payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    pub fn of(ics: &str) -> Self {
        ETag(blake3::hash(ics.as_bytes()).to_hex()[..32].to_string())
    }

    /// Accepts the bare hash or an HTTP quoted (optionally weak) form.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let raw = raw.strip_prefix("W/").unwrap_or(raw);
        ETag(raw.trim_matches('"').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The quoted form used in HTTP headers and DAV:getetag.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Denormalized copy of the primary master's fields for listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Projection {
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub all_day: bool,
    pub recurring: bool,
}

impl Projection {
    pub fn from_payload(payload: &Payload) -> Self {
        let Some(master) = payload.primary_master() else {
            return Projection::default();
        };
        Projection {
            summary: master.summary.clone(),
            description: master.description.clone(),
            location: master.location.clone(),
            start: master.start_utc(),
            end: master.end_utc(),
            all_day: master.start.as_ref().is_some_and(EventTime::is_date),
            recurring: payload.masters().any(|m| m.is_recurring()),
        }
    }

    /// Whether a listing over `range` must include this item. Recurring items
    /// always qualify since the projection only covers the first occurrence.
    pub fn may_overlap(&self, range: &TimeRange) -> bool {
        if self.recurring {
            return true;
        }
        match (self.start, self.end) {
            (Some(start), Some(end)) => range.overlaps(start, end),
            (Some(start), None) => range.overlaps(start, start),
            _ => false,
        }
    }
}

/// A persisted event resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredItem {
    pub uuid: String,
    /// iCalendar UID
    pub uid: String,
    pub collection_id: String,
    /// Resource name within the collection
    pub path: String,
    #[serde(rename = "ical_data")]
    pub ics: String,
    pub etag: ETag,
    #[serde(flatten)]
    pub projection: Projection,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an item.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub uuid: String,
    pub uid: String,
    pub path: String,
    pub ics: String,
    pub projection: Projection,
}

impl NewItem {
    pub fn from_payload(uuid: String, payload: &Payload) -> CalCardResult<Self> {
        let uid = payload
            .uid()
            .ok_or_else(|| CalCardError::InvalidInput("payload has no UID".into()))?
            .to_string();
        Ok(NewItem {
            path: format!("{}.ics", uuid),
            uuid,
            uid,
            ics: payload.to_ics()?,
            projection: Projection::from_payload(payload),
        })
    }
}

/// A rewrite of an existing item.
#[derive(Debug, Clone)]
pub struct ItemUpdate {
    pub ics: String,
    pub projection: Projection,
    /// Change records to append, in order. A series split logs the old
    /// series' modification and the new series' creation.
    pub changes: Vec<ChangeKind>,
}

impl ItemUpdate {
    pub fn from_payload(payload: &Payload, changes: Vec<ChangeKind>) -> CalCardResult<Self> {
        Ok(ItemUpdate {
            ics: payload.to_ics()?,
            projection: Projection::from_payload(payload),
            changes,
        })
    }
}

#[async_trait]
pub trait ComponentStore: Send + Sync {
    async fn create_collection(&self, collection: Collection) -> CalCardResult<Collection>;

    async fn get_collection(&self, id: &str) -> CalCardResult<Collection>;

    async fn list_collections(&self) -> CalCardResult<Vec<Collection>>;

    async fn get_item(&self, uuid: &str) -> CalCardResult<StoredItem>;

    async fn get_item_by_path(&self, collection_id: &str, path: &str) -> CalCardResult<StoredItem>;

    /// Items of a collection, narrowed by `range` when given (see
    /// [`Projection::may_overlap`]), ordered by start.
    async fn list_items(
        &self,
        collection_id: &str,
        range: Option<&TimeRange>,
    ) -> CalCardResult<Vec<StoredItem>>;

    /// Fails with `Conflict` when the collection already holds the UID.
    async fn create_item(&self, collection_id: &str, item: NewItem) -> CalCardResult<StoredItem>;

    /// Fails with `Conflict` when `expected` is given and differs from the stored tag.
    async fn update_item(
        &self,
        uuid: &str,
        update: ItemUpdate,
        expected: Option<&ETag>,
    ) -> CalCardResult<StoredItem>;

    async fn delete_item(&self, uuid: &str, expected: Option<&ETag>) -> CalCardResult<()>;

    /// Logs `deleted` in the source collection and `created` in the target.
    async fn move_item(&self, uuid: &str, target_collection_id: &str) -> CalCardResult<StoredItem>;

    async fn changes_since(&self, collection_id: &str, since: Option<&str>) -> CalCardResult<ChangeSet>;

    /// Drop change records older than `older_than`. Returns how many were dropped.
    async fn prune_changes(&self, collection_id: &str, older_than: DateTime<Utc>) -> CalCardResult<usize>;
}

fn check_etag(uuid: &str, stored: &ETag, expected: Option<&ETag>) -> CalCardResult<()> {
    match expected {
        Some(expected) if expected != stored => Err(CalCardError::Conflict(uuid.to_string())),
        _ => Ok(()),
    }
}
