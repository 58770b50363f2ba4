//! Query window for listing and expansion.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_WINDOW_DAYS;
use crate::error::{CalCardError, CalCardResult};

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Default for TimeRange {
    /// Default range: ±DEFAULT_WINDOW_DAYS from now
    fn default() -> Self {
        let now = Utc::now();
        TimeRange {
            start: now - Duration::days(DEFAULT_WINDOW_DAYS),
            end: now + Duration::days(DEFAULT_WINDOW_DAYS),
        }
    }
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> CalCardResult<Self> {
        if end < start {
            return Err(CalCardError::InvalidInput(format!(
                "range end {} precedes start {}",
                end.to_rfc3339(),
                start.to_rfc3339()
            )));
        }
        Ok(TimeRange { start, end })
    }

    /// Build a range from query parameters.
    /// - Each bound is RFC 3339 or YYYY-MM-DD
    /// - A date `start` means start of day, a date `end` means the following midnight
    /// - Missing bounds default to ±DEFAULT_WINDOW_DAYS from now
    pub fn from_args(start: Option<&str>, end: Option<&str>) -> CalCardResult<Self> {
        let now = Utc::now();

        let start = match start {
            Some(s) => parse_bound(s, false)?,
            None => now - Duration::days(DEFAULT_WINDOW_DAYS),
        };
        let end = match end {
            Some(s) => parse_bound(s, true)?,
            None => now + Duration::days(DEFAULT_WINDOW_DAYS),
        };

        TimeRange::new(start, end)
    }

    /// Whether an occurrence spanning `[start, end)` intersects this window.
    /// Zero-length occurrences count when their instant falls inside it.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        if end <= start {
            return start >= self.start && start < self.end;
        }
        start < self.end && end > self.start
    }
}

fn parse_bound(s: &str, is_end: bool) -> CalCardResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
        CalCardError::InvalidInput(format!(
            "Invalid date '{}'. Expected YYYY-MM-DD or RFC 3339",
            s
        ))
    })?;
    let date = if is_end {
        date.succ_opt()
            .ok_or_else(|| CalCardError::InvalidInput(format!("date '{}' out of range", s)))?
    } else {
        date
    };
    Ok(date.and_time(chrono::NaiveTime::MIN).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_date_end_bound_includes_whole_day() {
        let range = TimeRange::from_args(Some("2024-01-01"), Some("2024-02-29")).unwrap();
        assert_eq!(range.start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(range.end, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_rfc3339_bounds_are_taken_verbatim() {
        let range =
            TimeRange::from_args(Some("2024-01-25T00:00:00Z"), Some("2024-01-31T12:00:00+02:00"))
                .unwrap();
        assert_eq!(range.end, at(31, 10));
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        assert!(matches!(
            TimeRange::from_args(Some("2024-02-01"), Some("2024-01-01")),
            Err(CalCardError::InvalidInput(_))
        ));
        assert!(TimeRange::from_args(Some("yesterday"), None).is_err());
    }

    #[test]
    fn test_overlap_is_half_open() {
        let range = TimeRange::new(at(10, 0), at(11, 0)).unwrap();
        assert!(range.overlaps(at(9, 23), at(10, 1)));
        assert!(!range.overlaps(at(9, 23), at(10, 0)));
        assert!(!range.overlaps(at(11, 0), at(11, 1)));
        assert!(range.overlaps(at(10, 0), at(10, 0)));
        assert!(!range.overlaps(at(11, 0), at(11, 0)));
    }
}
