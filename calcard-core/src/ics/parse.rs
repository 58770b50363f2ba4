//! ICS payload parsing using the icalendar crate's parser.

use chrono::{DateTime, NaiveDateTime, Utc};
use icalendar::{
    DatePerhapsTime,
    parser::{Component as RawComponent, Property, read_calendar, unfold},
};

use crate::error::{CalCardError, CalCardResult};
use crate::event::{Component, CustomProperty, EventTime, Override, Payload, Reminder, VEvent};

/// Properties mapped onto `VEvent` fields; anything else is kept verbatim.
const KNOWN_PROPERTIES: &[&str] = &[
    "UID",
    "SUMMARY",
    "DESCRIPTION",
    "LOCATION",
    "DTSTART",
    "DTEND",
    "DURATION",
    "RRULE",
    "EXDATE",
    "RECURRENCE-ID",
    "DTSTAMP",
    "SEQUENCE",
];

/// Parse an iCalendar object into its VEVENT components.
pub fn parse_payload(content: &str) -> CalCardResult<Payload> {
    let unfolded = unfold(content);
    let calendar = read_calendar(&unfolded).map_err(CalCardError::IcsParse)?;

    let components = calendar
        .components
        .iter()
        .filter(|c| c.name == "VEVENT")
        .map(parse_component)
        .collect::<CalCardResult<Vec<_>>>()?;

    if components.is_empty() {
        return Err(CalCardError::IcsParse("no VEVENT found".into()));
    }

    Ok(Payload { components })
}

fn parse_component(vevent: &RawComponent) -> CalCardResult<Component> {
    let event = parse_vevent(vevent)?;

    let Some(prop) = vevent.find_prop("RECURRENCE-ID") else {
        return Ok(Component::Master(event));
    };

    let recurrence_id = DatePerhapsTime::try_from(prop)
        .ok()
        .map(to_event_time)
        .ok_or_else(|| {
            CalCardError::IcsParse(format!("unreadable RECURRENCE-ID '{}'", prop.val.as_ref()))
        })?;
    let key = recurrence_id.occurrence_key().ok_or_else(|| {
        CalCardError::IcsParse(format!("RECURRENCE-ID '{}' has no UTC instant", prop.val.as_ref()))
    })?;

    Ok(Component::Exception(Override {
        key,
        date_only: recurrence_id.is_date(),
        event,
    }))
}

fn parse_vevent(vevent: &RawComponent) -> CalCardResult<VEvent> {
    let uid = vevent
        .find_prop("UID")
        .map(|p| p.val.to_string())
        .ok_or_else(|| CalCardError::IcsParse("VEVENT without UID".into()))?;

    let start = time_prop(vevent, "DTSTART");
    let end = time_prop(vevent, "DTEND");

    let duration = vevent
        .find_prop("DURATION")
        .and_then(|p| parse_duration(p.val.as_ref()));

    let rrule = vevent
        .find_prop("RRULE")
        .map(|p| p.val.to_string())
        .filter(|r| !r.trim().is_empty());

    let exdates: Vec<EventTime> = vevent
        .properties
        .iter()
        .filter(|p| p.name == "EXDATE")
        .flat_map(parse_exdate_property)
        .collect();

    let stamp = vevent
        .find_prop("DTSTAMP")
        .and_then(|p| parse_utc_stamp(p.val.as_ref()));

    let sequence = vevent
        .find_prop("SEQUENCE")
        .and_then(|p| p.val.as_ref().trim().parse().ok());

    // Reminders from VALARM components
    let reminders: Vec<Reminder> = vevent
        .components
        .iter()
        .filter(|c| c.name == "VALARM")
        .filter_map(|alarm| {
            let trigger = alarm.find_prop("TRIGGER")?.val.as_ref();
            let minutes = parse_trigger_minutes(trigger)?;
            Some(Reminder { minutes })
        })
        .collect();

    let custom_properties = vevent
        .properties
        .iter()
        .filter(|p| !KNOWN_PROPERTIES.contains(&p.name.as_ref()))
        .map(|p| CustomProperty {
            name: p.name.to_string(),
            params: p
                .params
                .iter()
                .map(|param| {
                    (
                        param.key.to_string(),
                        param.val.as_ref().map(|v| v.to_string()).unwrap_or_default(),
                    )
                })
                .collect(),
            value: p.val.to_string(),
        })
        .collect();

    Ok(VEvent {
        uid,
        summary: text_prop(vevent, "SUMMARY"),
        description: text_prop(vevent, "DESCRIPTION"),
        location: text_prop(vevent, "LOCATION"),
        start,
        end,
        duration,
        rrule,
        exdates,
        stamp,
        sequence,
        reminders,
        custom_properties,
    })
}

fn text_prop(vevent: &RawComponent, name: &str) -> Option<String> {
    vevent.find_prop(name).map(|p| p.val.to_string())
}

fn time_prop(vevent: &RawComponent, name: &str) -> Option<EventTime> {
    vevent
        .find_prop(name)
        .and_then(|p| DatePerhapsTime::try_from(p).ok())
        .map(to_event_time)
}

/// Convert icalendar's DatePerhapsTime to our EventTime, preserving timezone info
fn to_event_time(dpt: DatePerhapsTime) -> EventTime {
    match dpt {
        DatePerhapsTime::Date(d) => EventTime::Date(d),
        DatePerhapsTime::DateTime(cal_dt) => match cal_dt {
            icalendar::CalendarDateTime::Utc(dt) => EventTime::DateTimeUtc(dt),
            icalendar::CalendarDateTime::Floating(naive) => EventTime::DateTimeFloating(naive),
            icalendar::CalendarDateTime::WithTimezone { date_time, tzid } => {
                EventTime::DateTimeZoned {
                    datetime: date_time,
                    tzid,
                }
            }
        },
    }
}

/// Parse an EXDATE property into a list of EventTime values.
///
/// Handles TZID and VALUE=DATE parameters, UTC and floating values, and
/// comma-separated lists: `EXDATE;TZID=Europe/Berlin:20240108T100000,20240115T100000`
fn parse_exdate_property(prop: &Property) -> Vec<EventTime> {
    let tzid = prop
        .params
        .iter()
        .find(|p| p.key == "TZID")
        .and_then(|p| p.val.as_ref().map(|v| v.to_string()));

    let is_date = prop
        .params
        .iter()
        .any(|p| p.key == "VALUE" && p.val.as_ref().map(|v| v.as_ref()) == Some("DATE"));

    prop.val
        .as_ref()
        .split(',')
        .filter_map(|s| {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if is_date || s.len() == 8 {
                chrono::NaiveDate::parse_from_str(s, "%Y%m%d")
                    .ok()
                    .map(EventTime::Date)
            } else if let Some(utc) = s.strip_suffix('Z') {
                NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S")
                    .ok()
                    .map(|dt| EventTime::DateTimeUtc(dt.and_utc()))
            } else if let Some(ref tz) = tzid {
                NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S")
                    .ok()
                    .map(|dt| EventTime::DateTimeZoned {
                        datetime: dt,
                        tzid: tz.clone(),
                    })
            } else {
                NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S")
                    .ok()
                    .map(EventTime::DateTimeFloating)
            }
        })
        .collect()
}

fn parse_utc_stamp(value: &str) -> Option<DateTime<Utc>> {
    let body = value.trim().strip_suffix('Z')?;
    NaiveDateTime::parse_from_str(body, "%Y%m%dT%H%M%S")
        .ok()
        .map(|dt| dt.and_utc())
}

/// DURATION value (`PT1H30M`, `P1D`). Negative durations are rejected.
fn parse_duration(value: &str) -> Option<chrono::Duration> {
    let value = value.trim().trim_start_matches('+');
    if value.starts_with('-') {
        return None;
    }
    let duration = iso8601::duration(value).ok()?;
    let std_duration: std::time::Duration = duration.into();
    chrono::Duration::from_std(std_duration).ok()
}

/// Parse TRIGGER value to minutes before event (-PT30M, -P1D, etc.)
fn parse_trigger_minutes(value: &str) -> Option<i64> {
    let is_before = value.starts_with('-');
    let duration_str = value.trim_start_matches(['-', '+']);

    let duration = iso8601::duration(duration_str).ok()?;
    let std_duration: std::time::Duration = duration.into();
    let minutes = (std_duration.as_secs() / 60) as i64;

    Some(if is_before { minutes } else { -minutes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occurrence::OccurrenceKey;
    use chrono::{NaiveDate, TimeZone};

    const SERIES: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:TEST\r\n\
BEGIN:VEVENT\r\n\
UID:weekly@test\r\n\
SUMMARY:Standup\r\n\
DTSTART:20240122T090000Z\r\n\
DTEND:20240122T093000Z\r\n\
RRULE:FREQ=WEEKLY;COUNT=3\r\n\
EXDATE:20240205T090000Z\r\n\
X-CUSTOM;X-PARAM=1:kept\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:weekly@test\r\n\
RECURRENCE-ID:20240129T090000Z\r\n\
SUMMARY:Moved standup\r\n\
DTSTART:20240129T100000Z\r\n\
DTEND:20240129T103000Z\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    #[test]
    fn test_parse_partitions_master_and_exception() {
        let payload = parse_payload(SERIES).expect("Should parse");
        assert_eq!(payload.components.len(), 2);

        let master = payload.primary_master().expect("Should have master");
        assert_eq!(master.rrule.as_deref(), Some("FREQ=WEEKLY;COUNT=3"));
        assert_eq!(
            master.exdate_keys().into_iter().collect::<Vec<_>>(),
            vec!["20240205T090000Z".parse::<OccurrenceKey>().unwrap()]
        );
        assert_eq!(master.custom_properties.len(), 1);
        assert_eq!(master.custom_properties[0].value, "kept");

        let exception = payload.exceptions().next().expect("Should have exception");
        assert_eq!(exception.key.to_string(), "20240129T090000Z");
        assert!(!exception.date_only);
        assert_eq!(exception.event.summary.as_deref(), Some("Moved standup"));
    }

    #[test]
    fn test_zoned_recurrence_id_normalizes_to_utc_key() {
        let ics = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:TEST\r\n\
BEGIN:VEVENT\r\n\
UID:zoned@test\r\n\
RECURRENCE-ID;TZID=America/New_York:20240108T100000\r\n\
DTSTART;TZID=America/New_York:20240108T110000\r\n\
DTEND;TZID=America/New_York:20240108T120000\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

        let payload = parse_payload(ics).expect("Should parse");
        let exception = payload.exceptions().next().expect("Should have exception");
        assert_eq!(exception.key.to_string(), "20240108T150000Z");
    }

    #[test]
    fn test_duration_used_when_dtend_missing() {
        let ics = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:TEST\r\n\
BEGIN:VEVENT\r\n\
UID:dur@test\r\n\
DTSTART:20240101T100000Z\r\n\
DURATION:PT90M\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

        let payload = parse_payload(ics).expect("Should parse");
        let master = payload.primary_master().unwrap();
        assert_eq!(
            master.end_utc(),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 11, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_exdate_value_date_and_tzid_forms() {
        let ics = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:TEST\r\n\
BEGIN:VEVENT\r\n\
UID:ex@test\r\n\
DTSTART;VALUE=DATE:20240101\r\n\
RRULE:FREQ=DAILY\r\n\
EXDATE;VALUE=DATE:20240102,20240104\r\n\
EXDATE;TZID=Europe/Berlin:20240105T000000\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

        let payload = parse_payload(ics).expect("Should parse");
        let master = payload.primary_master().unwrap();
        assert_eq!(master.exdates.len(), 3);
        assert_eq!(
            master.exdates[0],
            EventTime::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())
        );
        assert!(matches!(master.exdates[2], EventTime::DateTimeZoned { .. }));
    }

    #[test]
    fn test_payload_without_vevent_is_malformed() {
        let ics = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:TEST\r\nEND:VCALENDAR\r\n";
        assert!(matches!(parse_payload(ics), Err(CalCardError::IcsParse(_))));
    }
}
