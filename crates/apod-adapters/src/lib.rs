//! Source adapter contract + the NASA APOD adapter.

use apod_core::{ApodRecord, RawApiRecord};
use apod_storage::{FetchError, HttpFetcher, Url};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "apod-adapters";

pub const APOD_SOURCE_ID: &str = "nasa-apod";

/// Path of the APOD resource relative to the API base URL.
pub const APOD_ENDPOINT: &str = "planetary/apod";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<RawApiRecord, AdapterError>;

    fn normalize(&self, raw: &RawApiRecord) -> Result<ApodRecord, AdapterError>;
}

/// Joins `path` onto `base_url`, treating the base as a directory even without a trailing slash.
pub fn endpoint_url(base_url: &str, path: &str) -> Result<Url, FetchError> {
    let invalid = |reason: String| FetchError::InvalidUrl {
        url: base_url.to_string(),
        reason,
    };

    let mut base = Url::parse(base_url.trim()).map_err(|e| invalid(e.to_string()))?;
    if base.cannot_be_a_base() {
        return Err(invalid("not a hierarchical url".to_string()));
    }
    if !base.path().ends_with('/') {
        let dir = format!("{}/", base.path());
        base.set_path(&dir);
    }
    base.join(path.trim_start_matches('/'))
        .map_err(|e| invalid(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct ApodAdapter {
    endpoint: Url,
    api_key: String,
}

impl ApodAdapter {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, AdapterError> {
        Ok(Self {
            endpoint: endpoint_url(base_url, APOD_ENDPOINT)?,
            api_key: api_key.into(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl SourceAdapter for ApodAdapter {
    fn source_id(&self) -> &'static str {
        APOD_SOURCE_ID
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<RawApiRecord, AdapterError> {
        let raw = http
            .fetch_json(
                ctx.run_id,
                self.source_id(),
                &self.endpoint,
                &[("api_key", self.api_key.as_str())],
            )
            .await?;
        Ok(raw)
    }

    fn normalize(&self, raw: &RawApiRecord) -> Result<ApodRecord, AdapterError> {
        normalize_apod(raw)
    }
}

fn is_absent(raw: &JsonValue) -> bool {
    match raw {
        JsonValue::Null => true,
        JsonValue::Bool(b) => !b,
        JsonValue::String(s) => s.is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::Number(_) => false,
    }
}

fn text_field(map: &Map<String, JsonValue>, key: &str) -> String {
    match map.get(key) {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Maps the raw payload onto the seven APOD fields; anything else in the payload is dropped.
///
/// No content validation happens here: odd URLs or dates pass through untouched.
pub fn normalize_apod(raw: &RawApiRecord) -> Result<ApodRecord, AdapterError> {
    if is_absent(raw) {
        return Err(AdapterError::InvalidInput(
            "No data received from API".to_string(),
        ));
    }
    let JsonValue::Object(map) = raw else {
        return Err(AdapterError::InvalidInput(format!(
            "expected a JSON object from API, got {raw}"
        )));
    };
    debug!(raw = %raw, "raw API response");

    let record = ApodRecord {
        title: text_field(map, "title"),
        explanation: text_field(map, "explanation"),
        url: text_field(map, "url"),
        hdurl: text_field(map, "hdurl"),
        date: text_field(map, "date"),
        media_type: text_field(map, "media_type"),
        copyright: text_field(map, "copyright"),
    };
    info!(date = %record.date, title = %record.title, "transformed APOD record");
    Ok(record)
}
