//! Occurrence keys.
//!
//! An occurrence key names one generated instance of a series by its
//! originally scheduled start, normalized to UTC at second precision. The
//! same `YYYYMMDDThhmmssZ` text is used for RECURRENCE-ID markers, EXDATE
//! entries and the `recurrence_id` clients send back, so every conversion
//! goes through this type.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::UTC_DATETIME_FORMAT;
use crate::error::CalCardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OccurrenceKey(DateTime<Utc>);

impl OccurrenceKey {
    pub fn from_instant(instant: DateTime<Utc>) -> Self {
        OccurrenceKey(instant.trunc_subsecs(0))
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for OccurrenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(UTC_DATETIME_FORMAT))
    }
}

impl FromStr for OccurrenceKey {
    type Err = CalCardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_suffix('Z')
            .ok_or_else(|| CalCardError::InvalidOccurrenceKey(s.to_string()))?;
        NaiveDateTime::parse_from_str(body, "%Y%m%dT%H%M%S")
            .map(|dt| OccurrenceKey(dt.and_utc()))
            .map_err(|_| CalCardError::InvalidOccurrenceKey(s.to_string()))
    }
}

impl Serialize for OccurrenceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OccurrenceKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_uses_rfc5545_utc_format() {
        let key = OccurrenceKey::from_instant(Utc.with_ymd_and_hms(2024, 1, 29, 9, 0, 0).unwrap());
        assert_eq!(key.to_string(), "20240129T090000Z");
        assert_eq!("20240129T090000Z".parse::<OccurrenceKey>().unwrap(), key);
    }

    #[test]
    fn test_key_drops_subsecond_precision() {
        let instant = Utc.with_ymd_and_hms(2024, 1, 29, 9, 0, 0).unwrap()
            + chrono::Duration::milliseconds(750);
        let key = OccurrenceKey::from_instant(instant);
        assert_eq!(key.to_string(), "20240129T090000Z");
    }

    #[test]
    fn test_key_rejects_floating_and_garbage() {
        assert!(matches!(
            "20240129T090000".parse::<OccurrenceKey>(),
            Err(CalCardError::InvalidOccurrenceKey(_))
        ));
        assert!("2024-01-29T09:00:00Z".parse::<OccurrenceKey>().is_err());
        assert!("".parse::<OccurrenceKey>().is_err());
    }
}
