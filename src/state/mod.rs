pub mod backend;
pub mod migration;
pub mod models;
pub mod retry;
pub mod schema;
pub mod sqlite;

use chrono::{DateTime, SecondsFormat, Utc};

/// Current time in the fixed-width format every table stores.
pub fn now() -> String {
    format_ts(Utc::now())
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
