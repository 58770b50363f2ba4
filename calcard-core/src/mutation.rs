//! Scope-aware rewriting of recurring event payloads.
//!
//! Every operation here edits a parsed [`Payload`] in place and reports what
//! kind of write the caller has to persist. Preconditions are checked before
//! the payload is touched; callers discard the payload on error, so a failed
//! mutation never reaches the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CalCardError, CalCardResult};
use crate::event::{Component, EventTime, Override, Payload, VEvent};
use crate::occurrence::OccurrenceKey;
use crate::recurrence::{rule_reaches, truncate_rule, validate_rule};

/// Breadth of an update or delete on a recurring series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationScope {
    #[default]
    All,
    This,
    ThisAndFuture,
}

impl MutationScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationScope::All => "all",
            MutationScope::This => "this",
            MutationScope::ThisAndFuture => "this_and_future",
        }
    }
}

impl fmt::Display for MutationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationScope {
    type Err = CalCardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "all" => Ok(MutationScope::All),
            "this" => Ok(MutationScope::This),
            "this_and_future" => Ok(MutationScope::ThisAndFuture),
            other => Err(CalCardError::InvalidInput(format!(
                "unknown scope '{}'. Expected all, this or this_and_future",
                other
            ))),
        }
    }
}

/// Field changes for an update. `None` leaves a field alone; an empty string
/// clears a text field, and an empty `rrule` removes recurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EventPatch {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Only honoured for scope `all`
    #[serde(default)]
    pub all_day: Option<bool>,
    /// Ignored for scope `this`
    #[serde(default)]
    pub rrule: Option<String>,
}

impl EventPatch {
    fn touches_time(&self) -> bool {
        self.start.is_some() || self.end.is_some() || self.all_day.is_some()
    }

    fn validate(&self) -> CalCardResult<()> {
        match (self.start, self.end) {
            (Some(start), Some(end)) if end < start => Err(CalCardError::InvalidInput(format!(
                "end {} precedes start {}",
                end.to_rfc3339(),
                start.to_rfc3339()
            ))),
            _ => Ok(()),
        }
    }
}

/// Result of [`apply_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// The series was split into an old and a new master
    pub split: bool,
}

/// Result of [`apply_delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Nothing of the item survives; delete it from the store
    RemoveItem,
    /// The payload was rewritten and must be stored
    Rewritten,
}

/// Apply `patch` to `payload` with the given scope.
pub fn apply_update(
    payload: &mut Payload,
    patch: &EventPatch,
    scope: MutationScope,
    key: Option<OccurrenceKey>,
    now: DateTime<Utc>,
) -> CalCardResult<UpdateOutcome> {
    patch.validate()?;
    if scope != MutationScope::This {
        if let Some(rule) = patch.rrule.as_deref().filter(|r| !r.trim().is_empty()) {
            validate_rule(rule, None)?;
        }
    }

    match scope {
        MutationScope::All => {
            update_all(payload, patch, now)?;
            Ok(UpdateOutcome { split: false })
        }
        MutationScope::This => {
            let key = require_key(key)?;
            require_master(payload)?;
            update_this(payload, patch, key, now)?;
            Ok(UpdateOutcome { split: false })
        }
        MutationScope::ThisAndFuture => {
            let key = require_key(key)?;
            let index = require_master(payload)?;
            let index = payload.owning_master_index(&key).unwrap_or(index);
            let master = payload.components[index].event();

            if !master.is_recurring() {
                debug!(uid = %master.uid, "Split on a non-recurring event; updating whole item");
                update_all(payload, patch, now)?;
                return Ok(UpdateOutcome { split: false });
            }

            let starts_at_or_after_split = master.start_utc().is_none_or(|s| s >= key.instant());
            if starts_at_or_after_split {
                update_from_series_start(payload, index, patch, key, now)?;
                Ok(UpdateOutcome { split: false })
            } else {
                split_series(payload, index, patch, key, now)?;
                Ok(UpdateOutcome { split: true })
            }
        }
    }
}

/// Delete with the given scope.
pub fn apply_delete(
    payload: &mut Payload,
    scope: MutationScope,
    key: Option<OccurrenceKey>,
    now: DateTime<Utc>,
) -> CalCardResult<DeleteOutcome> {
    if scope == MutationScope::All {
        return Ok(DeleteOutcome::RemoveItem);
    }
    let key = require_key(key)?;
    let primary = require_master(payload)?;
    let index = payload.owning_master_index(&key).unwrap_or(primary);

    match scope {
        MutationScope::All => Ok(DeleteOutcome::RemoveItem),
        MutationScope::This => {
            let Some(master) = payload.master_at_mut(index) else {
                return Err(missing_master(payload));
            };

            let is_own_start = master.start_utc().map(OccurrenceKey::from_instant) == Some(key);
            if !master.is_recurring() && is_own_start {
                payload.components.remove(index);
                payload.remove_exceptions(|o| o.key == key);
                if !payload.has_master() {
                    return Ok(DeleteOutcome::RemoveItem);
                }
                return Ok(DeleteOutcome::Rewritten);
            }

            if !master.exdate_keys().contains(&key) {
                let marker = marker_time(master, key);
                master.exdates.push(marker);
            }
            touch(master, now);
            payload.remove_exceptions(|o| o.key == key);
            debug!(key = %key, "Excluded single occurrence");
            Ok(DeleteOutcome::Rewritten)
        }
        MutationScope::ThisAndFuture => {
            if !payload.masters().any(VEvent::is_recurring) {
                return Ok(DeleteOutcome::RemoveItem);
            }

            let split = key.instant();
            drop_masters_from(payload, split);
            payload.remove_exceptions(|o| o.key >= key);

            // Every remaining master starts before the split
            let owner = payload.owning_master_index(&key);
            if let Some(master) = owner.and_then(|i| payload.master_at_mut(i)) {
                if master.is_recurring() {
                    truncate_master(master, split);
                    touch(master, now);
                }
            }

            if !payload.has_master() {
                return Ok(DeleteOutcome::RemoveItem);
            }
            Ok(DeleteOutcome::Rewritten)
        }
    }
}

fn require_key(key: Option<OccurrenceKey>) -> CalCardResult<OccurrenceKey> {
    key.ok_or_else(|| {
        CalCardError::InvalidInput("recurrence_id is required for scope this/this_and_future".into())
    })
}

/// Index of the first master, or `MissingMaster`.
fn require_master(payload: &Payload) -> CalCardResult<usize> {
    payload
        .components
        .iter()
        .position(|c| matches!(c, Component::Master(_)))
        .ok_or_else(|| missing_master(payload))
}

fn missing_master(payload: &Payload) -> CalCardError {
    CalCardError::MissingMaster(payload.uid().unwrap_or_default().to_string())
}

fn update_all(payload: &mut Payload, patch: &EventPatch, now: DateTime<Utc>) -> CalCardResult<()> {
    let has_master = payload.has_master();
    if !has_master && (patch.touches_time() || patch.rrule.is_some()) {
        return Err(missing_master(payload));
    }

    for component in payload.components.iter_mut() {
        let event = match component {
            Component::Master(m) => m,
            // Orphaned overrides are the only copy of the event's text
            Component::Exception(o) if !has_master => &mut o.event,
            Component::Exception(_) => continue,
        };
        apply_text(event, patch);
        touch(event, now);
    }

    if let Some(master) = payload.primary_master_mut() {
        apply_times(master, patch, patch.all_day)?;
        if let Some(ref rule) = patch.rrule {
            set_rule(master, rule);
        }
    }
    Ok(())
}

fn update_this(
    payload: &mut Payload,
    patch: &EventPatch,
    key: OccurrenceKey,
    now: DateTime<Utc>,
) -> CalCardResult<()> {
    for component in payload.components.iter_mut() {
        if let Component::Master(m) = component {
            m.exdates.retain(|t| t.occurrence_key() != Some(key));
        }
    }

    if payload.exception(&key).is_none() {
        let index = payload
            .owning_master_index(&key)
            .ok_or_else(|| missing_master(payload))?;
        let master = payload.components[index].event();
        let exception = synthesize_exception(master, key);
        debug!(uid = %master.uid, key = %key, "Created exception component");
        payload.components.push(Component::Exception(exception));
    }

    let exception = payload
        .exception_mut(&key)
        .ok_or_else(|| CalCardError::InvalidInput(format!("no occurrence at {}", key)))?;
    apply_text(&mut exception.event, patch);
    apply_times(&mut exception.event, patch, None)?;
    touch(&mut exception.event, now);
    Ok(())
}

/// `this_and_future` at or before the first occurrence of a master: the whole
/// master is "future", so it is patched in place.
fn update_from_series_start(
    payload: &mut Payload,
    index: usize,
    patch: &EventPatch,
    key: OccurrenceKey,
    now: DateTime<Utc>,
) -> CalCardResult<()> {
    let series_start = payload.components[index].event().start_utc();
    let cutoff = series_start.map_or(key, |s| key.min(OccurrenceKey::from_instant(s)));
    let next = next_master_start(payload, index);
    let index = prune_future(payload, index, cutoff, patch, now);

    let Some(master) = payload.master_at_mut(index) else {
        return Err(missing_master(payload));
    };
    apply_text(master, patch);
    apply_times(master, patch, None)?;
    if let Some(ref rule) = patch.rrule {
        set_rule(master, rule);
    }
    bound_before(master, next);
    touch(master, now);
    Ok(())
}

fn split_series(
    payload: &mut Payload,
    index: usize,
    patch: &EventPatch,
    key: OccurrenceKey,
    now: DateTime<Utc>,
) -> CalCardResult<()> {
    let split = key.instant();
    let next = next_master_start(payload, index);
    let index = prune_future(payload, index, key, patch, now);
    let Some(old) = payload.master_at_mut(index) else {
        return Err(missing_master(payload));
    };
    let original = old.clone();
    truncate_master(old, split);
    touch(old, now);

    let mut new_master = new_series(&original, key);
    apply_text(&mut new_master, patch);
    apply_times(&mut new_master, patch, None)?;
    if let Some(ref rule) = patch.rrule {
        set_rule(&mut new_master, rule);
    }
    bound_before(&mut new_master, next);
    touch(&mut new_master, now);

    debug!(
        uid = %original.uid,
        split = %key,
        old_rule = ?original.rrule,
        new_rule = ?new_master.rrule,
        "Split recurring series"
    );

    payload
        .components
        .insert(index + 1, Component::Master(new_master));
    Ok(())
}

/// Copy of `master` restarted at `key`, keeping the original rule and its
/// bound, plus the exclusions that fall in the new series.
fn new_series(master: &VEvent, key: OccurrenceKey) -> VEvent {
    let split = key.instant();
    let duration = master.occurrence_duration();
    let mut series = master.clone();

    series.start = master.start.as_ref().map(|s| s.with_instant(split));
    series.end = match (&master.end, &master.start) {
        (Some(end), _) => Some(end.with_instant(split + duration)),
        (None, Some(start)) if master.duration.is_none() => Some(start.with_instant(split + duration)),
        _ => None,
    };
    series.exdates = master
        .exdates
        .iter()
        .filter(|t| t.occurrence_key().is_some_and(|k| k >= key))
        .cloned()
        .collect();
    series.sequence = None;
    series
}

/// End `master` just before `split`: strip its bounds, add UNTIL, and keep only earlier exclusions.
fn truncate_master(master: &mut VEvent, split: DateTime<Utc>) {
    let date_only = master.start.as_ref().is_some_and(EventTime::is_date);
    if let Some(rule) = master.rrule.take() {
        master.rrule = Some(truncate_rule(&rule, split - Duration::seconds(1), date_only));
    }
    let cutoff = OccurrenceKey::from_instant(split);
    master
        .exdates
        .retain(|t| t.occurrence_key().is_some_and(|k| k < cutoff));
}

/// Start of the earliest master beginning after the one at `index`.
fn next_master_start(payload: &Payload, index: usize) -> Option<DateTime<Utc>> {
    let anchor = payload.components.get(index)?.event().start_utc()?;
    payload
        .masters()
        .filter_map(VEvent::start_utc)
        .filter(|start| *start > anchor)
        .min()
}

/// Stop `master` before `next`, where a later master of the same payload
/// takes over. Rules that already end earlier are left alone.
fn bound_before(master: &mut VEvent, next: Option<DateTime<Utc>>) {
    let (Some(next), Some(start), Some(rule)) = (next, master.start.as_ref(), master.rrule.as_deref())
    else {
        return;
    };
    if !rule_reaches(start, rule, next) {
        return;
    }
    let bounded = truncate_rule(rule, next - Duration::seconds(1), start.is_date());
    debug!(uid = %master.uid, rule = %bounded, "Bounded series before the next master");
    master.rrule = Some(bounded);
}

/// Drop exceptions at or after `cutoff` and carry the patch's text to the
/// masters starting after the one at `index`, which are part of the future
/// too. Returns the master's new index.
fn prune_future(
    payload: &mut Payload,
    index: usize,
    cutoff: OccurrenceKey,
    patch: &EventPatch,
    now: DateTime<Utc>,
) -> usize {
    let anchor = payload.components.get(index).and_then(|c| c.event().start_utc());
    let mut new_index = index;

    let components = std::mem::take(&mut payload.components);
    for (i, mut component) in components.into_iter().enumerate() {
        match &mut component {
            Component::Exception(o) if o.key >= cutoff => continue,
            Component::Master(m) if i != index => {
                let later = matches!((anchor, m.start_utc()), (Some(anchor), Some(start)) if start > anchor);
                if later {
                    apply_text(m, patch);
                    touch(m, now);
                }
            }
            _ => {}
        }
        if i == index {
            new_index = payload.components.len();
        }
        payload.components.push(component);
    }
    new_index
}

/// Remove masters starting at or after `split`.
fn drop_masters_from(payload: &mut Payload, split: DateTime<Utc>) {
    payload.components.retain(|c| match c {
        Component::Master(m) => m.start_utc().is_none_or(|s| s < split),
        Component::Exception(_) => true,
    });
}

/// Exception component for the occurrence at `key`, seeded from its master.
fn synthesize_exception(master: &VEvent, key: OccurrenceKey) -> Override {
    let slot = key.instant();
    let duration = master.occurrence_duration();
    let shape = master
        .start
        .clone()
        .unwrap_or(EventTime::DateTimeUtc(slot));
    let date_only = shape.is_date();

    Override {
        key,
        date_only,
        event: VEvent {
            uid: master.uid.clone(),
            summary: master.summary.clone(),
            description: master.description.clone(),
            location: master.location.clone(),
            start: Some(shape.with_instant(slot)),
            end: Some(shape.with_instant(slot + duration)),
            ..Default::default()
        },
    }
}

/// EXDATE entry for `key` in the master's shape: DATE for all-day series, UTC otherwise.
fn marker_time(master: &VEvent, key: OccurrenceKey) -> EventTime {
    if master.start.as_ref().is_some_and(EventTime::is_date) {
        EventTime::Date(key.instant().date_naive())
    } else {
        EventTime::DateTimeUtc(key.instant())
    }
}

fn apply_text(event: &mut VEvent, patch: &EventPatch) {
    let cleared = |value: &String| Some(value.clone()).filter(|v| !v.is_empty());
    if let Some(ref summary) = patch.summary {
        event.summary = cleared(summary);
    }
    if let Some(ref description) = patch.description {
        event.description = cleared(description);
    }
    if let Some(ref location) = patch.location {
        event.location = cleared(location);
    }
}

/// Apply start/end/all-day changes. A new start without a new end keeps the
/// current duration.
fn apply_times(event: &mut VEvent, patch: &EventPatch, all_day: Option<bool>) -> CalCardResult<()> {
    if patch.start.is_none() && patch.end.is_none() && all_day.is_none() {
        return Ok(());
    }

    let duration = event.occurrence_duration();
    let start = patch
        .start
        .or_else(|| event.start_utc())
        .ok_or_else(|| CalCardError::InvalidInput(format!("event '{}' has no start", event.uid)))?;
    let end = match (patch.end, patch.start) {
        (Some(end), _) => end,
        (None, Some(_)) => start + duration,
        (None, None) => event.end_utc().unwrap_or(start + duration),
    };
    if end < start {
        return Err(CalCardError::InvalidInput(format!(
            "end {} precedes start {}",
            end.to_rfc3339(),
            start.to_rfc3339()
        )));
    }

    let all_day = all_day.unwrap_or_else(|| event.start.as_ref().is_some_and(EventTime::is_date));
    if all_day {
        let start_date = start.date_naive();
        let mut end_date = end.date_naive();
        if end.time() != NaiveTime::MIN {
            end_date = end_date.succ_opt().unwrap_or(end_date);
        }
        if end_date <= start_date {
            end_date = start_date.succ_opt().unwrap_or(start_date);
        }
        event.start = Some(EventTime::Date(start_date));
        event.end = Some(EventTime::Date(end_date));
    } else {
        let shape = match event.start {
            Some(ref t) if !t.is_date() => t.clone(),
            _ => EventTime::DateTimeUtc(start),
        };
        event.start = Some(shape.with_instant(start));
        event.end = Some(shape.with_instant(end));
    }
    event.duration = None;
    Ok(())
}

fn set_rule(master: &mut VEvent, rule: &str) {
    let rule = rule.trim();
    if rule.is_empty() {
        master.rrule = None;
        master.exdates.clear();
    } else {
        master.rrule = Some(rule.trim_start_matches("RRULE:").to_string());
    }
}

fn touch(event: &mut VEvent, now: DateTime<Utc>) {
    event.bump_sequence();
    event.stamp = Some(now);
}
