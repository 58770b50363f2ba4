//! Calendar payload types.
//!
//! A stored item owns one iCalendar payload. The payload is modelled as an
//! ordered list of VEVENT components, each either a series master (no
//! RECURRENCE-ID) or an override of one generated occurrence. A payload may
//! hold several masters sharing one UID after a "this and future" split, so
//! nothing here assumes there is exactly one.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};

use crate::error::CalCardResult;
use crate::ics;
use crate::occurrence::OccurrenceKey;

/// Start/end/recurrence-id value, preserving how the payload expressed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTime {
    Date(NaiveDate),
    DateTimeUtc(DateTime<Utc>),
    DateTimeFloating(NaiveDateTime),
    DateTimeZoned {
        datetime: NaiveDateTime,
        tzid: String,
    },
}

impl EventTime {
    pub fn is_date(&self) -> bool {
        matches!(self, EventTime::Date(_))
    }

    /// The IANA zone named by a zoned value, if chrono-tz knows it.
    pub fn zone(&self) -> Option<chrono_tz::Tz> {
        match self {
            EventTime::DateTimeZoned { tzid, .. } => tzid.parse().ok(),
            _ => None,
        }
    }

    /// Absolute instant. Dates and floating times are read as UTC, as are
    /// zoned times whose TZID chrono-tz does not recognise.
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            EventTime::Date(d) => d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()),
            EventTime::DateTimeUtc(dt) => Some(*dt),
            EventTime::DateTimeFloating(dt) => Some(dt.and_utc()),
            EventTime::DateTimeZoned { datetime, .. } => match self.zone() {
                Some(tz) => resolve_local(&tz, datetime),
                None => Some(datetime.and_utc()),
            },
        }
    }

    /// Express `instant` in the same shape (date, UTC, floating, zone) as `self`.
    pub fn with_instant(&self, instant: DateTime<Utc>) -> EventTime {
        match self {
            EventTime::Date(_) => EventTime::Date(instant.date_naive()),
            EventTime::DateTimeUtc(_) => EventTime::DateTimeUtc(instant),
            EventTime::DateTimeFloating(_) => EventTime::DateTimeFloating(instant.naive_utc()),
            EventTime::DateTimeZoned { tzid, .. } => EventTime::DateTimeZoned {
                datetime: match self.zone() {
                    Some(tz) => instant.with_timezone(&tz).naive_local(),
                    None => instant.naive_utc(),
                },
                tzid: tzid.clone(),
            },
        }
    }

    /// Occurrence key for this value (UTC, second precision).
    pub fn occurrence_key(&self) -> Option<OccurrenceKey> {
        self.to_utc().map(OccurrenceKey::from_instant)
    }
}

/// The instant a wall-clock time in `tz` denotes. Ambiguous times take the
/// earlier instant; a time skipped by a DST gap is read with the offset in
/// effect before the gap (RFC 5545 section 3.3.5), so 02:30 on a spring-forward
/// night in New York is 07:30 UTC.
pub fn resolve_local(tz: &chrono_tz::Tz, local: &NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(local) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => Some(dt.with_timezone(&Utc)),
        LocalResult::None => {
            let before_gap = tz.from_local_datetime(&(*local - Duration::days(1))).earliest()?;
            let offset = before_gap.offset().fix().local_minus_utc();
            Some((*local - Duration::seconds(i64::from(offset))).and_utc())
        }
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventTime::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            EventTime::DateTimeUtc(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M UTC")),
            EventTime::DateTimeFloating(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M")),
            EventTime::DateTimeZoned { datetime, tzid } => {
                write!(f, "{} {}", datetime.format("%Y-%m-%d %H:%M"), tzid)
            }
        }
    }
}

/// A reminder/alarm (VALARM) on an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    /// Minutes before the event to trigger
    pub minutes: i64,
}

/// A property calcard does not interpret, kept for round-tripping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomProperty {
    pub name: String,
    pub params: Vec<(String, String)>,
    pub value: String,
}

/// One VEVENT component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VEvent {
    pub uid: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: Option<EventTime>,
    pub end: Option<EventTime>,
    /// DURATION, used when DTEND is absent
    pub duration: Option<Duration>,
    pub rrule: Option<String>,
    pub exdates: Vec<EventTime>,
    /// DTSTAMP
    pub stamp: Option<DateTime<Utc>>,
    pub sequence: Option<i64>,
    pub reminders: Vec<Reminder>,
    pub custom_properties: Vec<CustomProperty>,
}

impl VEvent {
    pub fn is_recurring(&self) -> bool {
        self.rrule.as_deref().is_some_and(|r| !r.trim().is_empty())
    }

    pub fn start_utc(&self) -> Option<DateTime<Utc>> {
        self.start.as_ref().and_then(EventTime::to_utc)
    }

    /// Length of one occurrence: DTEND - DTSTART, else DURATION, else one day
    /// for all-day events and zero otherwise.
    pub fn occurrence_duration(&self) -> Duration {
        let start = self.start_utc();
        let end = self.end.as_ref().and_then(EventTime::to_utc);
        match (start, end, self.duration) {
            (Some(s), Some(e), _) if e >= s => e - s,
            (_, _, Some(d)) => d,
            _ if self.start.as_ref().is_some_and(EventTime::is_date) => Duration::days(1),
            _ => Duration::zero(),
        }
    }

    pub fn end_utc(&self) -> Option<DateTime<Utc>> {
        self.start_utc().map(|s| s + self.occurrence_duration())
    }

    /// EXDATE entries normalized to occurrence keys.
    pub fn exdate_keys(&self) -> HashSet<OccurrenceKey> {
        self.exdates
            .iter()
            .filter_map(EventTime::occurrence_key)
            .collect()
    }

    pub fn bump_sequence(&mut self) {
        self.sequence = Some(self.sequence.unwrap_or(0) + 1);
    }
}

/// A component replacing one generated occurrence of a series.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub key: OccurrenceKey,
    /// RECURRENCE-ID was (and will be written as) a DATE value
    pub date_only: bool,
    pub event: VEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    Master(VEvent),
    Exception(Override),
}

impl Component {
    pub fn event(&self) -> &VEvent {
        match self {
            Component::Master(event) => event,
            Component::Exception(o) => &o.event,
        }
    }
}

/// Parsed contents of one stored item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    pub components: Vec<Component>,
}

impl Payload {
    pub fn parse(ics: &str) -> CalCardResult<Self> {
        ics::parse_payload(ics)
    }

    pub fn to_ics(&self) -> CalCardResult<String> {
        ics::generate_payload(self)
    }

    pub fn uid(&self) -> Option<&str> {
        self.components.first().map(|c| c.event().uid.as_str())
    }

    pub fn masters(&self) -> impl Iterator<Item = &VEvent> {
        self.components.iter().filter_map(|c| match c {
            Component::Master(m) => Some(m),
            Component::Exception(_) => None,
        })
    }

    pub fn exceptions(&self) -> impl Iterator<Item = &Override> {
        self.components.iter().filter_map(|c| match c {
            Component::Exception(o) => Some(o),
            Component::Master(_) => None,
        })
    }

    pub fn has_master(&self) -> bool {
        self.masters().next().is_some()
    }

    pub fn primary_master(&self) -> Option<&VEvent> {
        self.masters().next()
    }

    pub fn primary_master_mut(&mut self) -> Option<&mut VEvent> {
        self.components.iter_mut().find_map(|c| match c {
            Component::Master(m) => Some(m),
            Component::Exception(_) => None,
        })
    }

    pub fn master_at_mut(&mut self, index: usize) -> Option<&mut VEvent> {
        match self.components.get_mut(index) {
            Some(Component::Master(m)) => Some(m),
            _ => None,
        }
    }

    /// Component index of the master a given occurrence belongs to: the
    /// latest-starting master that starts at or before the occurrence, or
    /// the first master when the occurrence precedes all of them.
    pub fn owning_master_index(&self, key: &OccurrenceKey) -> Option<usize> {
        let mut best: Option<(usize, DateTime<Utc>)> = None;
        let mut first = None;
        for (index, component) in self.components.iter().enumerate() {
            let Component::Master(master) = component else {
                continue;
            };
            first.get_or_insert(index);
            let Some(start) = master.start_utc() else {
                continue;
            };
            if start <= key.instant() && best.is_none_or(|(_, s)| start >= s) {
                best = Some((index, start));
            }
        }
        best.map(|(index, _)| index).or(first)
    }

    pub fn exception(&self, key: &OccurrenceKey) -> Option<&Override> {
        self.exceptions().find(|o| o.key == *key)
    }

    pub fn exception_mut(&mut self, key: &OccurrenceKey) -> Option<&mut Override> {
        self.components.iter_mut().find_map(|c| match c {
            Component::Exception(o) if o.key == *key => Some(o),
            _ => None,
        })
    }

    /// Drop exception components matching `pred`. Returns how many were removed.
    pub fn remove_exceptions(&mut self, pred: impl Fn(&Override) -> bool) -> usize {
        let before = self.components.len();
        self.components
            .retain(|c| !matches!(c, Component::Exception(o) if pred(o)));
        before - self.components.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn master_starting(start: DateTime<Utc>) -> Component {
        Component::Master(VEvent {
            uid: "series".into(),
            start: Some(EventTime::DateTimeUtc(start)),
            rrule: Some("FREQ=DAILY".into()),
            ..Default::default()
        })
    }

    #[test]
    fn test_zoned_time_converts_through_its_zone() {
        let t = EventTime::DateTimeZoned {
            datetime: NaiveDate::from_ymd_opt(2024, 7, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
            tzid: "Europe/Berlin".into(),
        };
        assert_eq!(t.to_utc(), Some(utc(2024, 7, 1, 7)));
        assert_eq!(t.with_instant(utc(2024, 12, 2, 8)).to_string(), "2024-12-02 09:00 Europe/Berlin");
    }

    #[test]
    fn test_time_in_dst_gap_uses_offset_before_gap() {
        let t = EventTime::DateTimeZoned {
            datetime: NaiveDate::from_ymd_opt(2024, 3, 10)
                .unwrap()
                .and_hms_opt(2, 30, 0)
                .unwrap(),
            tzid: "America/New_York".into(),
        };
        assert_eq!(
            t.to_utc(),
            Some(utc(2024, 3, 10, 7) + Duration::minutes(30))
        );

        // Repeated hour on the fall-back night resolves to its first pass
        let repeated = EventTime::DateTimeZoned {
            datetime: NaiveDate::from_ymd_opt(2024, 11, 3)
                .unwrap()
                .and_hms_opt(1, 30, 0)
                .unwrap(),
            tzid: "America/New_York".into(),
        };
        assert_eq!(repeated.to_utc(), Some(utc(2024, 11, 3, 5) + Duration::minutes(30)));
    }

    #[test]
    fn test_unknown_tzid_is_read_as_utc() {
        let t = EventTime::DateTimeZoned {
            datetime: NaiveDate::from_ymd_opt(2024, 7, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
            tzid: "W. Europe Standard Time".into(),
        };
        assert_eq!(t.to_utc(), Some(utc(2024, 7, 1, 9)));
    }

    #[test]
    fn test_duration_falls_back_to_one_day_for_all_day_events() {
        let event = VEvent {
            start: Some(EventTime::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())),
            ..Default::default()
        };
        assert_eq!(event.occurrence_duration(), Duration::days(1));
    }

    #[test]
    fn test_owning_master_is_latest_starting_before_occurrence() {
        let payload = Payload {
            components: vec![master_starting(utc(2024, 1, 1, 9)), master_starting(utc(2024, 1, 10, 9))],
        };
        let early = OccurrenceKey::from_instant(utc(2024, 1, 5, 9));
        let late = OccurrenceKey::from_instant(utc(2024, 1, 12, 9));
        let before_all = OccurrenceKey::from_instant(utc(2023, 12, 1, 9));
        assert_eq!(payload.owning_master_index(&early), Some(0));
        assert_eq!(payload.owning_master_index(&late), Some(1));
        assert_eq!(payload.owning_master_index(&before_all), Some(0));
    }
}
