/// Default half-width of the listing window when a client gives no range.
pub const DEFAULT_WINDOW_DAYS: i64 = 30;

/// Default cap on generated occurrences per master component.
pub const DEFAULT_MAX_INSTANCES: u16 = 2000;

/// RFC 5545 UTC date-time layout shared by override markers, EXDATE entries,
/// UNTIL bounds and the occurrence keys clients pass back.
pub const UTC_DATETIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

pub const PRODID: &str = "-//calcard//EN";

/// Domain suffix appended to generated iCalendar UIDs.
pub const UID_DOMAIN: &str = "calcard";
