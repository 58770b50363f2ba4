//! Change tracking for WebDAV-Sync (RFC 6578).
//!
//! Every item write appends one [`ChangeRecord`] per affected resource,
//! stamped with a freshly issued [`SyncToken`] that becomes the collection's
//! current token. Clients hand a token back to ask for everything appended
//! after it.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CalCardError, CalCardResult};

/// Opaque, strictly increasing sync checkpoint.
///
/// Rendered as zero-padded nanoseconds since the epoch and a random suffix,
/// so lexical order matches issue order. Callers must not parse it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncToken(String);

impl SyncToken {
    /// Issue a token strictly greater than `previous`.
    pub fn issue(previous: Option<&SyncToken>) -> Self {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX).max(0) as u64;
        let floor = previous.and_then(SyncToken::nanos).map_or(0, |n| n.saturating_add(1));
        let nanos = now.max(floor);
        let suffix: u64 = rand::thread_rng().r#gen();
        SyncToken(format!("{:020}-{:016x}", nanos, suffix))
    }

    /// Wrap a token received from a client or read from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        SyncToken(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn nanos(&self) -> Option<u64> {
        self.0.split_once('-').and_then(|(n, _)| n.parse().ok())
    }
}

impl fmt::Display for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cheap "anything changed" fingerprint for a collection. Never compared
/// for order, only for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CTag(String);

impl CTag {
    pub fn fresh() -> Self {
        CTag(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        CTag(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> CalCardResult<Self> {
        match s {
            "created" => Ok(ChangeKind::Created),
            "modified" => Ok(ChangeKind::Modified),
            "deleted" => Ok(ChangeKind::Deleted),
            other => Err(CalCardError::InvalidInput(format!("unknown change kind '{}'", other))),
        }
    }
}

/// One append-only change log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    /// Append order within the store
    pub id: i64,
    pub collection_id: String,
    /// Resource name within the collection, e.g. `<uuid>.ics`
    pub resource_path: String,
    pub resource_uid: String,
    pub kind: ChangeKind,
    pub token: SyncToken,
    pub created_at: DateTime<Utc>,
}

/// Answer to a changes-since query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// Latest record per resource, in append order
    pub records: Vec<ChangeRecord>,
    /// The collection's current token, the client's next checkpoint
    pub token: SyncToken,
}

/// Checkpoint state a store keeps per collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenState<'a> {
    pub current: &'a SyncToken,
    /// Oldest checkpoint still answerable: the collection's initial token, or
    /// the newest token dropped by pruning
    pub floor: &'a SyncToken,
}

/// Pick the records a client holding `since` has not seen.
///
/// - no token: initial sync, nothing to report
/// - the current token: nothing new
/// - the floor token: everything retained
/// - a token stamped on a retained record: everything appended after it
/// - anything else: `InvalidSyncToken`
pub fn select_changes<'r>(
    log: impl IntoIterator<Item = &'r ChangeRecord>,
    state: TokenState<'_>,
    since: Option<&str>,
) -> CalCardResult<Vec<ChangeRecord>> {
    let since = match since.map(str::trim) {
        None | Some("") => return Ok(Vec::new()),
        Some(s) => s,
    };
    if since == state.current.as_str() {
        return Ok(Vec::new());
    }

    let log: Vec<&ChangeRecord> = log.into_iter().collect();
    if since == state.floor.as_str() {
        return Ok(coalesce(log.into_iter().cloned()));
    }

    let Some(checkpoint) = log.iter().find(|r| r.token.as_str() == since).map(|r| r.id) else {
        warn!(token = since, "Unknown sync token");
        return Err(CalCardError::InvalidSyncToken(since.to_string()));
    };
    Ok(coalesce(
        log.into_iter().filter(|r| r.id > checkpoint).cloned(),
    ))
}

/// Keep only the latest record per resource path, ordered by when that
/// latest record was appended.
pub fn coalesce(records: impl IntoIterator<Item = ChangeRecord>) -> Vec<ChangeRecord> {
    let mut latest: HashMap<String, ChangeRecord> = HashMap::new();
    for record in records {
        match latest.get(&record.resource_path) {
            Some(existing) if existing.id > record.id => {}
            _ => {
                latest.insert(record.resource_path.clone(), record);
            }
        }
    }
    let mut out: Vec<ChangeRecord> = latest.into_values().collect();
    out.sort_by_key(|r| r.id);
    out
}

/// Per-resource outcome in a sync report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    /// Resource exists; fetch it if the entity tag differs from yours
    Ok { etag: String },
    /// Resource is gone
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncEntry {
    pub resource_path: String,
    #[serde(flatten)]
    pub status: SyncStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub entries: Vec<SyncEntry>,
    pub token: SyncToken,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, path: &str, kind: ChangeKind, token: &SyncToken) -> ChangeRecord {
        ChangeRecord {
            id,
            collection_id: "cal".into(),
            resource_path: path.into(),
            resource_uid: format!("{}@test", path),
            kind,
            token: token.clone(),
            created_at: Utc::now(),
        }
    }

    fn lineage(n: usize) -> Vec<SyncToken> {
        let mut tokens = vec![SyncToken::issue(None)];
        for _ in 0..n {
            let next = SyncToken::issue(tokens.last());
            tokens.push(next);
        }
        tokens
    }

    #[test]
    fn test_tokens_strictly_increase() {
        let tokens = lineage(50);
        assert!(tokens.windows(2).all(|w| w[0] < w[1]));
        assert!(tokens.windows(2).all(|w| w[0].nanos() < w[1].nanos()));
    }

    #[test]
    fn test_token_issued_after_future_token_still_increases() {
        let future = SyncToken::from_raw(format!("{:020}-{:016x}", u64::MAX / 2, 7));
        let next = SyncToken::issue(Some(&future));
        assert!(next > future);
    }

    #[test]
    fn test_select_changes() {
        let t = lineage(3);
        let log = vec![
            record(1, "a.ics", ChangeKind::Created, &t[1]),
            record(2, "b.ics", ChangeKind::Created, &t[2]),
            record(3, "a.ics", ChangeKind::Modified, &t[3]),
        ];
        let state = TokenState {
            current: &t[3],
            floor: &t[0],
        };

        assert!(select_changes(&log, state.clone(), None).unwrap().is_empty());
        assert!(select_changes(&log, state.clone(), Some(t[3].as_str())).unwrap().is_empty());

        let all = select_changes(&log, state.clone(), Some(t[0].as_str())).unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3]);

        let after_first = select_changes(&log, state.clone(), Some(t[1].as_str())).unwrap();
        assert_eq!(after_first.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3]);

        let after_second = select_changes(&log, state.clone(), Some(t[2].as_str())).unwrap();
        assert_eq!(after_second.len(), 1);
        assert_eq!(after_second[0].kind, ChangeKind::Modified);

        assert!(matches!(
            select_changes(&log, state, Some("1-deadbeef")),
            Err(CalCardError::InvalidSyncToken(_))
        ));
    }

    #[test]
    fn test_coalesce_reports_delete_after_create() {
        let t = lineage(2);
        let records = vec![
            record(1, "a.ics", ChangeKind::Created, &t[1]),
            record(2, "a.ics", ChangeKind::Deleted, &t[2]),
        ];
        let out = coalesce(records);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, ChangeKind::Deleted);
    }

    #[test]
    fn test_sync_status_serializes_flat() {
        let entry = SyncEntry {
            resource_path: "a.ics".into(),
            status: SyncStatus::Ok { etag: "\"x\"".into() },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["etag"], "\"x\"");
    }
}
