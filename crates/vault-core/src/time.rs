//! Timestamp encoding shared by every SQLite table.
//!
//! Fixed-width RFC 3339 in UTC with millisecond precision, so lexical order of
//! the stored strings equals chronological order and `WHERE col <= ?` range
//! scans on an index are correct.

use chrono::{DateTime, SecondsFormat, Utc};

pub fn to_db(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn from_db(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
