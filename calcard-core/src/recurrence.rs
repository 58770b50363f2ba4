//! RRULE expansion for recurring events.
//!
//! Expands every master component of a payload into concrete occurrences
//! within a time window, dropping EXDATEs and layering exception components
//! over the slots they replace. Exceptions whose marker the rule never
//! generated ("strays") are still emitted when they intersect the window.

use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rrule::RRuleSet;
use serde::Serialize;
use tracing::{debug, warn};

use crate::constants::UTC_DATETIME_FORMAT;
use crate::error::{CalCardError, CalCardResult};
use crate::event::{EventTime, Override, Payload, VEvent, resolve_local};
use crate::occurrence::OccurrenceKey;
use crate::time_range::TimeRange;

/// One concrete occurrence produced by expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Occurrence {
    pub series_uid: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
    /// Set for occurrences of a recurring series and for overridden single events
    pub occurrence_key: Option<OccurrenceKey>,
    pub is_exception: bool,
}

/// Expand all masters of `payload` into occurrences intersecting `range`,
/// sorted by start time.
///
/// `max_instances` caps how many slots a single master may generate; hitting
/// the cap truncates that series and is logged.
pub fn expand_payload(payload: &Payload, range: &TimeRange, max_instances: u16) -> Vec<Occurrence> {
    let excluded: HashSet<OccurrenceKey> = payload
        .masters()
        .flat_map(|m| m.exdate_keys())
        .collect();
    let mut visited: HashSet<OccurrenceKey> = HashSet::new();
    let mut occurrences = Vec::new();

    for master in payload.masters() {
        let (Some(start), Some(start_utc)) = (master.start.as_ref(), master.start_utc()) else {
            warn!(uid = %master.uid, "Skipping master without a usable DTSTART");
            continue;
        };
        let duration = master.occurrence_duration();

        let slots = match master.rrule.as_deref().filter(|_| master.is_recurring()) {
            None => vec![start_utc],
            Some(rule) => match generate_slots(start, rule, duration, range, max_instances) {
                Ok(slots) => slots,
                Err(e) => {
                    warn!(uid = %master.uid, error = %e, "Skipping master with unusable RRULE");
                    continue;
                }
            },
        };

        for slot in slots {
            let key = OccurrenceKey::from_instant(slot);
            if excluded.contains(&key) {
                debug!(uid = %master.uid, key = %key, "Occurrence excluded by EXDATE");
                continue;
            }
            if !visited.insert(key) {
                continue;
            }

            let occurrence = match payload.exception(&key) {
                Some(exception) => overlay(master, exception, slot, duration),
                None => Occurrence {
                    series_uid: master.uid.clone(),
                    summary: master.summary.clone(),
                    description: master.description.clone(),
                    location: master.location.clone(),
                    start: slot,
                    end: slot + duration,
                    all_day: start.is_date(),
                    occurrence_key: master.is_recurring().then_some(key),
                    is_exception: false,
                },
            };
            if range.overlaps(occurrence.start, occurrence.end) {
                occurrences.push(occurrence);
            }
        }
    }

    // Exceptions the rules never reached in this window
    for exception in payload.exceptions() {
        if visited.contains(&exception.key) || excluded.contains(&exception.key) {
            continue;
        }
        let Some(master) = payload
            .owning_master_index(&exception.key)
            .and_then(|i| payload.components.get(i))
            .map(|c| c.event())
        else {
            continue;
        };
        let slot = exception.key.instant();
        let occurrence = overlay(master, exception, slot, master.occurrence_duration());
        if range.overlaps(occurrence.start, occurrence.end) {
            debug!(uid = %master.uid, key = %exception.key, "Emitting stray exception");
            occurrences.push(occurrence);
        }
    }

    occurrences.sort_by(|a, b| {
        (a.start, a.end, a.occurrence_key).cmp(&(b.start, b.end, b.occurrence_key))
    });
    occurrences
}

/// Exception fields layered over the master's, falling back to the slot it replaces.
fn overlay(master: &VEvent, exception: &Override, slot: DateTime<Utc>, duration: Duration) -> Occurrence {
    let event = &exception.event;
    let start = event.start_utc().unwrap_or(slot);
    let end = match (&event.start, &event.end, event.duration) {
        (Some(_), Some(_), _) | (Some(_), None, Some(_)) => event.end_utc().unwrap_or(start + duration),
        _ => start + duration,
    };
    let all_day = event
        .start
        .as_ref()
        .or(master.start.as_ref())
        .is_some_and(EventTime::is_date);

    Occurrence {
        series_uid: master.uid.clone(),
        summary: event.summary.clone().or_else(|| master.summary.clone()),
        description: event.description.clone().or_else(|| master.description.clone()),
        location: event.location.clone().or_else(|| master.location.clone()),
        start,
        end,
        all_day,
        occurrence_key: Some(exception.key),
        is_exception: true,
    }
}

/// Rule-generated slot starts whose occurrence could intersect `range`.
///
/// Series anchored in a known zone are expanded in wall-clock time and each
/// slot is then resolved through the zone, so occurrences keep their local
/// time across DST changes and slots falling in a DST gap are shifted rather
/// than lost.
fn generate_slots(
    start: &EventTime,
    rule: &str,
    duration: Duration,
    range: &TimeRange,
    max_instances: u16,
) -> CalCardResult<Vec<DateTime<Utc>>> {
    let zone = start.zone();
    let rrule_set = parse_rule_set(start, rule)?;

    // Occurrences starting up to one duration before the window can still overlap it.
    // Subtract/add 1 second to make the bounds inclusive (after/before are exclusive).
    // Wall-clock bounds are widened by a day to cover any UTC offset.
    let slack = if zone.is_some() { Duration::days(1) } else { Duration::zero() };
    let tz: rrule::Tz = Utc.into();
    let after = (range.start - duration - slack - Duration::seconds(1)).with_timezone(&tz);
    let before = (range.end + slack + Duration::seconds(1)).with_timezone(&tz);

    let result = rrule_set.after(after).before(before).all(max_instances);
    if result.limited {
        warn!(
            rule,
            limit = max_instances,
            "Recurrence expansion hit the per-series instance cap"
        );
    }

    Ok(result
        .dates
        .iter()
        .filter_map(|dt| match zone {
            Some(zone) => resolve_local(&zone, &dt.naive_utc()),
            None => Some(dt.with_timezone(&Utc)),
        })
        .collect())
}

fn parse_rule_set(start: &EventTime, rule: &str) -> CalCardResult<RRuleSet> {
    build_rrule_string(start, rule)
        .parse()
        .map_err(|e| CalCardError::InvalidInput(format!("invalid RRULE '{}': {}", rule, e)))
}

/// Build an iCalendar-format DTSTART/RRULE block for the rrule crate parser.
fn build_rrule_string(start: &EventTime, rule: &str) -> String {
    // The rrule crate needs a datetime, so all-day dates become midnight UTC.
    // Zoned starts are handed over as wall-clock time (see `generate_slots`).
    let dtstart = match start {
        EventTime::Date(d) => format!("DTSTART:{}T000000Z", d.format("%Y%m%d")),
        EventTime::DateTimeUtc(dt) => format!("DTSTART:{}", dt.format(UTC_DATETIME_FORMAT)),
        EventTime::DateTimeFloating(dt) => format!("DTSTART:{}Z", dt.format("%Y%m%dT%H%M%S")),
        EventTime::DateTimeZoned { datetime, .. } => {
            format!("DTSTART:{}Z", datetime.format("%Y%m%dT%H%M%S"))
        }
    };

    format!("{}\nRRULE:{}", dtstart, normalize_until(rule, start.zone()))
}

/// Rewrite UNTIL into the UTC form the rrule crate accepts alongside our DTSTART.
/// Date-only bounds cover their whole day; floating bounds are read as UTC.
/// With a `zone`, UTC bounds are moved onto the zone's wall clock to match a
/// wall-clock DTSTART.
fn normalize_until(rule: &str, zone: Option<chrono_tz::Tz>) -> String {
    rule_parts(rule)
        .map(|part| match part.split_once('=') {
            Some((name, value)) if name.eq_ignore_ascii_case("UNTIL") => {
                if value.len() == 8 {
                    format!("UNTIL={}T235959Z", value)
                } else if !value.ends_with('Z') {
                    format!("UNTIL={}Z", value)
                } else {
                    let wall_clock = zone.and_then(|tz| {
                        NaiveDateTime::parse_from_str(value, UTC_DATETIME_FORMAT)
                            .ok()
                            .map(|until| until.and_utc().with_timezone(&tz).naive_local())
                    });
                    match wall_clock {
                        Some(until) => format!("UNTIL={}Z", until.format("%Y%m%dT%H%M%S")),
                        None => part.to_string(),
                    }
                }
            }
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn rule_parts(rule: &str) -> impl Iterator<Item = &str> {
    rule.trim()
        .trim_start_matches("RRULE:")
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

fn without_parts(rule: &str, names: &[&str]) -> String {
    rule_parts(rule)
        .filter(|part| {
            let name = part.split('=').next().unwrap_or_default();
            !names.iter().any(|n| n.eq_ignore_ascii_case(name))
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Remove both COUNT and UNTIL bounds.
pub fn strip_bounds(rule: &str) -> String {
    without_parts(rule, &["COUNT", "UNTIL"])
}

/// End a rule at `last` (inclusive). All-day series get a DATE bound.
pub fn truncate_rule(rule: &str, last: DateTime<Utc>, date_only: bool) -> String {
    let until = if date_only {
        last.format("%Y%m%d").to_string()
    } else {
        last.format(UTC_DATETIME_FORMAT).to_string()
    };
    format!("{};UNTIL={}", strip_bounds(rule), until)
}

/// Whether `rule`, anchored at `start`, generates an occurrence starting at or
/// after `limit`. Unusable rules are treated as unbounded.
pub fn rule_reaches(start: &EventTime, rule: &str, limit: DateTime<Utc>) -> bool {
    let Ok(rrule_set) = parse_rule_set(start, rule) else {
        return true;
    };
    // Same clock the rule set runs on: wall-clock for zoned starts
    let zone = start.zone();
    let clock_limit = match zone {
        Some(tz) => limit.with_timezone(&tz).naive_local().and_utc(),
        None => limit,
    };
    let tz: rrule::Tz = Utc.into();
    let after = (clock_limit - Duration::seconds(1)).with_timezone(&tz);
    !rrule_set.after(after).all(1).dates.is_empty()
}

/// Check that a rule is usable, anchored at `start` when known.
pub fn validate_rule(rule: &str, start: Option<&EventTime>) -> CalCardResult<()> {
    if rule.contains(['\r', '\n']) {
        return Err(CalCardError::InvalidInput("RRULE must be a single line".into()));
    }
    let fallback = EventTime::DateTimeUtc(DateTime::<Utc>::UNIX_EPOCH);
    parse_rule_set(start.unwrap_or(&fallback), rule).map(|_| ())
}
