//! Core of the calcard calendar server.
//!
//! - `event` and `ics` model and (de)serialize stored iCalendar payloads
//! - `recurrence` expands series into occurrences within a time range
//! - `mutation` applies scoped edits and deletes (`all`, `this`, `this_and_future`)
//! - `sync` tracks per-collection changes for WebDAV-Sync
//! - `store` persists collections, items and the change log
//! - `service` ties them together into the calendar use cases

pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod ics;
pub mod mutation;
pub mod occurrence;
pub mod recurrence;
pub mod service;
pub mod store;
pub mod sync;
pub mod time_range;

pub use error::{CalCardError, CalCardResult};
pub use event::{Component, EventTime, Override, Payload, VEvent};
pub use mutation::{DeleteOutcome, EventPatch, MutationScope};
pub use occurrence::OccurrenceKey;
pub use recurrence::Occurrence;
pub use service::{CalendarService, Instance, NewEvent};
pub use store::{Collection, ComponentStore, ETag, MemoryStore, NewCollection, SqliteStore, StoredItem};
pub use sync::{SyncEntry, SyncReport, SyncStatus, SyncToken};
pub use time_range::TimeRange;
