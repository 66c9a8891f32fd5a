//! Core domain model for the APOD loader.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "apod-core";

/// Calendar format the API uses for `date`, and the one the `DATE` column accepts.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Untyped API payload exactly as it came off the wire.
pub type RawApiRecord = serde_json::Value;

/// Normalized handoff contract from the adapter into the loader.
///
/// Every field defaults to the empty string when the API omits it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApodRecord {
    pub title: String,
    pub explanation: String,
    pub url: String,
    pub hdurl: String,
    pub date: String,
    pub media_type: String,
    pub copyright: String,
}

impl ApodRecord {
    /// Parses the business key for binding against a `DATE` column.
    pub fn calendar_date(&self) -> Result<NaiveDate, chrono::ParseError> {
        NaiveDate::parse_from_str(&self.date, DATE_FORMAT)
    }
}

/// Persisted row: the normalized record plus identity assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApodRow {
    pub id: i32,
    pub title: String,
    pub explanation: String,
    pub url: String,
    pub hdurl: String,
    pub date: NaiveDate,
    pub media_type: String,
    pub copyright: String,
    pub created_at: Option<NaiveDateTime>,
}

impl ApodRow {
    pub fn from_record(id: i32, date: NaiveDate, record: &ApodRecord, created_at: NaiveDateTime) -> Self {
        Self {
            id,
            title: record.title.clone(),
            explanation: record.explanation.clone(),
            url: record.url.clone(),
            hdurl: record.hdurl.clone(),
            date,
            media_type: record.media_type.clone(),
            copyright: record.copyright.clone(),
            created_at: Some(created_at),
        }
    }
}

/// Result of a load attempt. `AlreadyExists` is an expected idempotent skip, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    Inserted { id: i32 },
    AlreadyExists,
}

impl LoadOutcome {
    pub fn inserted(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }
}

impl fmt::Display for LoadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inserted { .. } => f.write_str("Data loaded successfully"),
            Self::AlreadyExists => f.write_str("Record already exists"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calendar_date_parses_api_format() {
        let record = ApodRecord {
            date: "2024-01-01".into(),
            ..Default::default()
        };
        assert_eq!(
            record.calendar_date().expect("date"),
            NaiveDate::from_ymd_opt(2024, 1, 1).expect("ymd")
        );
    }

    #[test]
    fn calendar_date_rejects_empty_and_garbage() {
        assert!(ApodRecord::default().calendar_date().is_err());
        let record = ApodRecord {
            date: "01/02/2024".into(),
            ..Default::default()
        };
        assert!(record.calendar_date().is_err());
    }

    #[test]
    fn load_outcome_messages() {
        assert_eq!(LoadOutcome::Inserted { id: 7 }.to_string(), "Data loaded successfully");
        assert_eq!(LoadOutcome::AlreadyExists.to_string(), "Record already exists");
        assert!(LoadOutcome::Inserted { id: 1 }.inserted());
        assert!(!LoadOutcome::AlreadyExists.inserted());
    }
}
