//! ICS payload generation.

use icalendar::{Alarm, Calendar, Component as _, EventLike, Property, Trigger, ValueType};

use crate::constants::{PRODID, UTC_DATETIME_FORMAT};
use crate::error::CalCardResult;
use crate::event::{Component, EventTime, Payload, VEvent};

/// Serialize a payload back to one VCALENDAR, components in payload order.
pub fn generate_payload(payload: &Payload) -> CalCardResult<String> {
    let mut cal = Calendar::new();

    for component in &payload.components {
        let ics_event = match component {
            Component::Master(master) => build_vevent(master, None),
            Component::Exception(exception) => {
                let recurrence_id = if exception.date_only {
                    EventTime::Date(exception.key.instant().date_naive())
                } else {
                    EventTime::DateTimeUtc(exception.key.instant())
                };
                build_vevent(&exception.event, Some(&recurrence_id))
            }
        };
        cal.push(ics_event);
    }

    let cal = cal.done();

    // Post-process to remove unnecessary bloat from the icalendar crate's output
    Ok(strip_ics_bloat(&cal.to_string()))
}

fn build_vevent(event: &VEvent, recurrence_id: Option<&EventTime>) -> icalendar::Event {
    let mut ics_event = icalendar::Event::new();
    ics_event.uid(&event.uid);

    // DTSTAMP is required by RFC 5545
    let dtstamp = event
        .stamp
        .unwrap_or_else(chrono::Utc::now)
        .format(UTC_DATETIME_FORMAT)
        .to_string();
    ics_event.add_property("DTSTAMP", &dtstamp);

    if let Some(seq) = event.sequence {
        ics_event.add_property("SEQUENCE", seq.to_string());
    }

    if let Some(ref start) = event.start {
        add_datetime_property(&mut ics_event, "DTSTART", start);
    }
    match (&event.end, event.duration) {
        (Some(end), _) => add_datetime_property(&mut ics_event, "DTEND", end),
        (None, Some(duration)) => {
            ics_event.add_property("DURATION", format_duration(duration));
        }
        (None, None) => {}
    }

    if let Some(ref recurrence_id) = recurrence_id {
        add_datetime_property(&mut ics_event, "RECURRENCE-ID", recurrence_id);
    }

    if let Some(ref summary) = event.summary {
        ics_event.summary(summary);
    }
    if let Some(ref desc) = event.description {
        ics_event.description(desc);
    }
    if let Some(ref loc) = event.location {
        ics_event.location(loc);
    }

    if let Some(ref rrule) = event.rrule {
        ics_event.add_property("RRULE", rrule);
    }
    for exdate in &event.exdates {
        add_exdate_property(&mut ics_event, exdate);
    }

    // Add alarms (VALARM components) - minimal per RFC 5545
    for reminder in &event.reminders {
        let trigger = Trigger::before_start(chrono::Duration::minutes(reminder.minutes));
        ics_event.alarm(Alarm::display("Reminder", trigger));
    }

    // Uninterpreted properties, preserved for round-tripping
    for custom in &event.custom_properties {
        let mut prop = Property::new(&custom.name, &custom.value);
        for (key, value) in &custom.params {
            prop.add_parameter(key, value);
        }
        ics_event.append_multi_property(prop);
    }

    ics_event.done()
}

/// Clean up ICS output from the icalendar crate
/// - Replace PRODID with ours
/// - Remove CALSCALE:GREGORIAN (it's the default)
/// - Remove DTSTAMP and UID inside VALARM sections (not required by RFC 5545)
fn strip_ics_bloat(ics: &str) -> String {
    let mut result = String::with_capacity(ics.len());
    let mut in_valarm = false;

    for line in ics.lines() {
        if line.starts_with("PRODID:") {
            result.push_str("PRODID:");
            result.push_str(PRODID);
            result.push_str("\r\n");
            continue;
        }

        if line == "CALSCALE:GREGORIAN" {
            continue;
        }

        if line == "BEGIN:VALARM" {
            in_valarm = true;
        } else if line == "END:VALARM" {
            in_valarm = false;
        }

        if in_valarm && (line.starts_with("DTSTAMP:") || line.starts_with("UID:")) {
            continue;
        }

        result.push_str(line);
        result.push_str("\r\n");
    }

    result
}

/// Add a datetime property with proper formatting based on EventTime variant
fn add_datetime_property(ics_event: &mut icalendar::Event, name: &str, time: &EventTime) {
    ics_event.append_property(time_property(name, time));
}

/// Add an EXDATE property for a single exception date
fn add_exdate_property(ics_event: &mut icalendar::Event, time: &EventTime) {
    ics_event.append_multi_property(time_property("EXDATE", time));
}

fn time_property(name: &str, time: &EventTime) -> Property {
    match time {
        EventTime::Date(d) => {
            let mut prop = Property::new(name, d.format("%Y%m%d").to_string());
            prop.append_parameter(ValueType::Date);
            prop
        }
        EventTime::DateTimeUtc(dt) => Property::new(name, dt.format(UTC_DATETIME_FORMAT).to_string()),
        EventTime::DateTimeFloating(dt) => {
            Property::new(name, dt.format("%Y%m%dT%H%M%S").to_string())
        }
        EventTime::DateTimeZoned { datetime, tzid } => {
            let mut prop = Property::new(name, datetime.format("%Y%m%dT%H%M%S").to_string());
            prop.add_parameter("TZID", tzid);
            prop
        }
    }
}

/// RFC 5545 DURATION value for a non-negative span, e.g. `PT1H30M` or `P1D`.
fn format_duration(duration: chrono::Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (days, rest) = (total / 86_400, total % 86_400);
    let (hours, minutes, seconds) = (rest / 3600, rest % 3600 / 60, rest % 60);

    let mut out = String::from("P");
    if days > 0 {
        out.push_str(&format!("{days}D"));
    }
    if rest > 0 || days == 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if seconds > 0 || rest == 0 {
            out.push_str(&format!("{seconds}S"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CustomProperty, Override, Reminder};
    use crate::ics::parse_payload;
    use crate::occurrence::OccurrenceKey;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn make_master() -> VEvent {
        VEvent {
            uid: "series@calcard".into(),
            summary: Some("Standup".into()),
            start: Some(EventTime::DateTimeUtc(
                Utc.with_ymd_and_hms(2024, 1, 22, 9, 0, 0).unwrap(),
            )),
            end: Some(EventTime::DateTimeUtc(
                Utc.with_ymd_and_hms(2024, 1, 22, 9, 30, 0).unwrap(),
            )),
            rrule: Some("FREQ=WEEKLY;COUNT=3".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_writes_every_component_under_one_calendar() {
        let key: OccurrenceKey = "20240129T090000Z".parse().unwrap();
        let payload = Payload {
            components: vec![
                Component::Master(make_master()),
                Component::Exception(Override {
                    key,
                    date_only: false,
                    event: VEvent {
                        summary: Some("Moved".into()),
                        ..make_master()
                    },
                }),
            ],
        };

        let ics = generate_payload(&payload).unwrap();
        assert_eq!(ics.matches("BEGIN:VEVENT").count(), 2);
        assert_eq!(ics.matches("BEGIN:VCALENDAR").count(), 1);
        assert!(ics.contains("RECURRENCE-ID:20240129T090000Z"), "ICS:\n{}", ics);
        assert!(ics.contains(&format!("PRODID:{}", PRODID)));
        assert!(!ics.contains("CALSCALE"));
    }

    #[test]
    fn test_date_only_recurrence_id_and_exdate_use_value_date() {
        let mut master = make_master();
        master.start = Some(EventTime::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()));
        master.end = Some(EventTime::Date(NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()));
        master.exdates = vec![EventTime::Date(NaiveDate::from_ymd_opt(2024, 3, 3).unwrap())];
        let payload = Payload {
            components: vec![
                Component::Master(master.clone()),
                Component::Exception(Override {
                    key: "20240302T000000Z".parse().unwrap(),
                    date_only: true,
                    event: master,
                }),
            ],
        };

        let ics = generate_payload(&payload).unwrap();
        assert!(ics.contains("RECURRENCE-ID;VALUE=DATE:20240302"), "ICS:\n{}", ics);
        assert!(ics.contains("EXDATE;VALUE=DATE:20240303"), "ICS:\n{}", ics);
    }

    #[test]
    fn test_generated_payload_parses_back() {
        let mut master = make_master();
        master.reminders = vec![Reminder { minutes: 15 }];
        master.custom_properties = vec![CustomProperty {
            name: "X-COLOR".into(),
            params: vec![],
            value: "blue".into(),
        }];
        master.exdates = vec![EventTime::DateTimeUtc(
            Utc.with_ymd_and_hms(2024, 1, 29, 9, 0, 0).unwrap(),
        )];
        let payload = Payload {
            components: vec![Component::Master(master)],
        };

        let parsed = parse_payload(&generate_payload(&payload).unwrap()).unwrap();
        let back = parsed.primary_master().unwrap();
        assert_eq!(back.rrule.as_deref(), Some("FREQ=WEEKLY;COUNT=3"));
        assert_eq!(back.reminders, vec![Reminder { minutes: 15 }]);
        assert_eq!(back.exdates.len(), 1);
        assert!(back.custom_properties.iter().any(|p| p.name == "X-COLOR" && p.value == "blue"));
    }

    #[test]
    fn test_alarm_is_minimal() {
        let mut master = make_master();
        master.reminders = vec![Reminder { minutes: 30 }];
        let ics = generate_payload(&Payload {
            components: vec![Component::Master(master)],
        })
        .unwrap();

        let valarm_section = ics
            .split("BEGIN:VALARM")
            .nth(1)
            .unwrap()
            .split("END:VALARM")
            .next()
            .unwrap();
        assert!(!valarm_section.contains("UID:"));
        assert!(!valarm_section.contains("DTSTAMP:"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::minutes(90)), "PT1H30M");
        assert_eq!(format_duration(chrono::Duration::days(1)), "P1D");
        assert_eq!(format_duration(chrono::Duration::zero()), "PT0S");
        assert_eq!(
            format_duration(chrono::Duration::days(1) + chrono::Duration::seconds(5)),
            "P1DT5S"
        );
    }
}
