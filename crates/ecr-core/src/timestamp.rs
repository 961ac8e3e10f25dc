//! Timestamp parsing and the single ISO-8601 rendering used in report JSON.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use thiserror::Error;

pub const DATE: &str = "%Y-%m-%d";
pub const ISO_SECONDS: &str = "%Y-%m-%dT%H:%M:%S";
pub const ISO_FRACTIONAL: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized timestamp {value:?} (expected one of: {expected})")]
pub struct TimestampError {
    pub value: String,
    pub expected: String,
}

/// Parse `value` with the first matching format. Date-only formats yield midnight.
pub fn parse_datetime(value: &str, formats: &[&str]) -> Result<NaiveDateTime, TimestampError> {
    let value = value.trim();
    for format in formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(dt);
        }
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Ok(date.and_time(NaiveTime::MIN));
        }
    }
    Err(TimestampError {
        value: value.to_string(),
        expected: formats.join(", "),
    })
}

/// Parse a publication date; any time-of-day component is discarded.
pub fn parse_date(value: &str, formats: &[&str]) -> Result<NaiveDate, TimestampError> {
    parse_datetime(value, formats).map(|dt| dt.date())
}

/// Seconds precision, plus microseconds only when they are non-zero.
pub fn format_datetime(dt: &NaiveDateTime) -> String {
    if dt.nanosecond() == 0 {
        dt.format(ISO_SECONDS).to_string()
    } else {
        dt.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    }
}

pub mod date {
    use chrono::NaiveDate;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(super::DATE).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw, &[super::DATE, super::ISO_FRACTIONAL, super::ISO_SECONDS])
            .map_err(D::Error::custom)
    }
}

pub mod datetime {
    use chrono::NaiveDateTime;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &NaiveDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_datetime(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_datetime(&raw, &[super::ISO_FRACTIONAL, super::ISO_SECONDS, super::DATE])
            .map_err(D::Error::custom)
    }
}
