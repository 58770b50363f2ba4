//! Calendar use cases: read an item, run the engine, write it back.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::UID_DOMAIN;
use crate::error::{CalCardError, CalCardResult};
use crate::event::{Component, EventTime, Payload, VEvent};
use crate::mutation::{DeleteOutcome, EventPatch, MutationScope, apply_delete, apply_update};
use crate::occurrence::OccurrenceKey;
use crate::recurrence::{Occurrence, expand_payload, validate_rule};
use crate::store::{
    Collection, ComponentStore, ETag, ItemUpdate, NewCollection, NewItem, StoredItem,
};
use crate::sync::{ChangeKind, SyncEntry, SyncReport, SyncStatus};
use crate::time_range::TimeRange;

/// Input for creating an event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewEvent {
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    /// Defaults to one hour after start, or the next day for all-day events
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub rrule: Option<String>,
    /// IANA zone to anchor DTSTART/DTEND in, so recurrences follow its DST rules
    #[serde(default)]
    pub timezone: Option<String>,
}

impl NewEvent {
    fn into_payload(self, uid: String, now: DateTime<Utc>) -> CalCardResult<Payload> {
        if self.summary.trim().is_empty() {
            return Err(CalCardError::InvalidInput("summary cannot be empty".into()));
        }

        let (start, end) = if self.all_day {
            let start = self.start.date_naive();
            let end = self
                .end
                .map(|e| e.date_naive())
                .filter(|e| *e > start)
                .unwrap_or(start + Duration::days(1));
            (EventTime::Date(start), EventTime::Date(end))
        } else {
            let end = self.end.unwrap_or(self.start + Duration::hours(1));
            if end < self.start {
                return Err(CalCardError::InvalidInput("end cannot precede start".into()));
            }
            match self.timezone.as_deref().filter(|tz| *tz != "UTC") {
                Some(tzid) => {
                    let tz: chrono_tz::Tz = tzid.parse().map_err(|_| {
                        CalCardError::InvalidInput(format!("invalid timezone '{}'", tzid))
                    })?;
                    let zoned = |t: DateTime<Utc>| EventTime::DateTimeZoned {
                        datetime: t.with_timezone(&tz).naive_local(),
                        tzid: tzid.to_string(),
                    };
                    (zoned(self.start), zoned(end))
                }
                None => (EventTime::DateTimeUtc(self.start), EventTime::DateTimeUtc(end)),
            }
        };

        let rrule = self.rrule.filter(|r| !r.trim().is_empty());
        if let Some(rule) = rrule.as_deref() {
            validate_rule(rule, Some(&start))?;
        }

        Ok(Payload {
            components: vec![Component::Master(VEvent {
                uid,
                summary: Some(self.summary),
                description: self.description.filter(|d| !d.is_empty()),
                location: self.location.filter(|l| !l.is_empty()),
                start: Some(start),
                end: Some(end),
                rrule,
                stamp: Some(now),
                sequence: Some(0),
                ..Default::default()
            })],
        })
    }
}

/// One row of an event listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    /// Item uuid; the handle for updates and deletes
    pub id: String,
    pub calendar_id: String,
    pub etag: ETag,
    #[serde(flatten)]
    pub occurrence: Occurrence,
}

pub struct CalendarService<S: ?Sized> {
    store: Arc<S>,
    max_instances: u16,
}

impl<S: ?Sized> Clone for CalendarService<S> {
    fn clone(&self) -> Self {
        CalendarService {
            store: Arc::clone(&self.store),
            max_instances: self.max_instances,
        }
    }
}

impl<S: ComponentStore + ?Sized> CalendarService<S> {
    pub fn new(store: Arc<S>, max_instances: u16) -> Self {
        CalendarService {
            store,
            max_instances: max_instances.max(1),
        }
    }

    pub async fn create_calendar(&self, new: NewCollection) -> CalCardResult<Collection> {
        self.store.create_collection(Collection::new(new)?).await
    }

    pub async fn calendar(&self, id: &str) -> CalCardResult<Collection> {
        self.store.get_collection(id).await
    }

    pub async fn calendars(&self) -> CalCardResult<Vec<Collection>> {
        self.store.list_collections().await
    }

    pub async fn create_event(&self, calendar_id: &str, new: NewEvent) -> CalCardResult<StoredItem> {
        let uuid = uuid::Uuid::new_v4().to_string();
        let uid = format!("{}@{}", uuid, UID_DOMAIN);
        let payload = new.into_payload(uid, Utc::now())?;

        let item = self
            .store
            .create_item(calendar_id, NewItem::from_payload(uuid, &payload)?)
            .await?;
        info!(calendar = calendar_id, uuid = %item.uuid, "Created event");
        Ok(item)
    }

    pub async fn get_event(&self, uuid: &str) -> CalCardResult<StoredItem> {
        self.store.get_item(uuid).await
    }

    /// Occurrences within `range`, one row per instance when `expand` is set
    /// and one per item otherwise. Items whose payload no longer parses are
    /// logged and left out.
    pub async fn list_events(
        &self,
        calendar_id: &str,
        range: &TimeRange,
        expand: bool,
    ) -> CalCardResult<Vec<Instance>> {
        let items = self.store.list_items(calendar_id, Some(range)).await?;
        let mut instances = Vec::new();

        for item in items {
            let payload = match Payload::parse(&item.ics) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(uuid = %item.uuid, error = %e, "Skipping unreadable event");
                    continue;
                }
            };

            let occurrences = if expand {
                expand_payload(&payload, range, self.max_instances)
            } else {
                summary_row(&item).into_iter().collect()
            };
            debug!(uuid = %item.uuid, count = occurrences.len(), "Listed event");

            instances.extend(occurrences.into_iter().map(|occurrence| Instance {
                id: item.uuid.clone(),
                calendar_id: item.collection_id.clone(),
                etag: item.etag.clone(),
                occurrence,
            }));
        }

        instances.sort_by(|a, b| {
            (a.occurrence.start, a.occurrence.end, &a.id).cmp(&(b.occurrence.start, b.occurrence.end, &b.id))
        });
        Ok(instances)
    }

    /// Apply `patch` with `scope`. The write is conditional on the entity tag
    /// read here, so a concurrent writer turns this into `Conflict` instead of
    /// a lost update. `expected` additionally pins the tag the client saw.
    pub async fn update_event(
        &self,
        uuid: &str,
        patch: &EventPatch,
        scope: MutationScope,
        key: Option<OccurrenceKey>,
        expected: Option<&ETag>,
    ) -> CalCardResult<StoredItem> {
        let item = self.store.get_item(uuid).await?;
        check_expected(&item, expected)?;

        let mut payload = Payload::parse(&item.ics)?;
        let outcome = apply_update(&mut payload, patch, scope, key, Utc::now())?;
        let changes = if outcome.split {
            vec![ChangeKind::Modified, ChangeKind::Created]
        } else {
            vec![ChangeKind::Modified]
        };

        let updated = self
            .store
            .update_item(uuid, ItemUpdate::from_payload(&payload, changes)?, Some(&item.etag))
            .await?;
        info!(uuid, %scope, split = outcome.split, "Updated event");
        Ok(updated)
    }

    pub async fn delete_event(
        &self,
        uuid: &str,
        scope: MutationScope,
        key: Option<OccurrenceKey>,
        expected: Option<&ETag>,
    ) -> CalCardResult<DeleteOutcome> {
        let item = self.store.get_item(uuid).await?;
        check_expected(&item, expected)?;

        let mut payload = match Payload::parse(&item.ics) {
            Ok(payload) => payload,
            // An unreadable item can still be removed as a whole
            Err(_) if scope == MutationScope::All => Payload::default(),
            Err(e) => return Err(e),
        };

        let outcome = apply_delete(&mut payload, scope, key, Utc::now())?;
        match outcome {
            DeleteOutcome::RemoveItem => {
                self.store.delete_item(uuid, Some(&item.etag)).await?;
            }
            DeleteOutcome::Rewritten => {
                let update = ItemUpdate::from_payload(&payload, vec![ChangeKind::Modified])?;
                self.store.update_item(uuid, update, Some(&item.etag)).await?;
            }
        }
        info!(uuid, %scope, ?outcome, "Deleted event");
        Ok(outcome)
    }

    pub async fn move_event(&self, uuid: &str, target_calendar_id: &str) -> CalCardResult<StoredItem> {
        let item = self.store.move_item(uuid, target_calendar_id).await?;
        info!(uuid, target = target_calendar_id, "Moved event");
        Ok(item)
    }

    /// An item by its resource name within a calendar, as named in sync reports.
    pub async fn get_resource(&self, calendar_id: &str, path: &str) -> CalCardResult<StoredItem> {
        self.store.get_item_by_path(calendar_id, path).await
    }

    /// Changes since `token`, with each surviving resource's current entity
    /// tag. A resource that vanished after its record was read is reported
    /// as not found.
    pub async fn sync_changes(&self, calendar_id: &str, token: Option<&str>) -> CalCardResult<SyncReport> {
        let changes = self.store.changes_since(calendar_id, token).await?;
        let mut entries = Vec::with_capacity(changes.records.len());

        for record in changes.records {
            let status = match record.kind {
                ChangeKind::Deleted => SyncStatus::NotFound,
                ChangeKind::Created | ChangeKind::Modified => {
                    match self.store.get_item_by_path(calendar_id, &record.resource_path).await {
                        Ok(item) => SyncStatus::Ok {
                            etag: item.etag.quoted(),
                        },
                        Err(CalCardError::NotFound { .. }) => SyncStatus::NotFound,
                        Err(e) => return Err(e),
                    }
                }
            };
            entries.push(SyncEntry {
                resource_path: record.resource_path,
                status,
            });
        }

        debug!(calendar = calendar_id, entries = entries.len(), token = %changes.token, "Sync report");
        Ok(SyncReport {
            entries,
            token: changes.token,
        })
    }

    /// Drop change records older than `retention_days` in every calendar.
    pub async fn prune_expired(&self, retention_days: u32) -> CalCardResult<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let mut pruned = 0;
        for calendar in self.store.list_collections().await? {
            pruned += self.store.prune_changes(&calendar.id, cutoff).await?;
        }
        Ok(pruned)
    }
}

fn check_expected(item: &StoredItem, expected: Option<&ETag>) -> CalCardResult<()> {
    match expected {
        Some(expected) if *expected != item.etag => Err(CalCardError::Conflict(item.uuid.clone())),
        _ => Ok(()),
    }
}

/// The non-expanded listing row: the item's first occurrence as projected.
fn summary_row(item: &StoredItem) -> Option<Occurrence> {
    let p = &item.projection;
    let start = p.start?;
    Some(Occurrence {
        series_uid: item.uid.clone(),
        summary: p.summary.clone(),
        description: p.description.clone(),
        location: p.location.clone(),
        start,
        end: p.end.unwrap_or(start),
        all_day: p.all_day,
        occurrence_key: None,
        is_exception: false,
    })
}
