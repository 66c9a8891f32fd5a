//! Postgres persistence + HTTP fetch utilities for the APOD loader.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use apod_core::{ApodRecord, ApodRow, LoadOutcome};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub use reqwest::Url;

pub const CRATE_NAME: &str = "apod-storage";

pub const DEFAULT_TABLE: &str = "apod_data";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response body from {url}: {source}")]
    MalformedBody {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid endpoint url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Strips the query string so credentials passed as parameters never reach logs or errors.
pub fn redact_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Issues exactly one GET and parses the body as JSON. Retrying is the caller's policy.
    pub async fn fetch_json(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &Url,
        query: &[(&str, &str)],
    ) -> Result<JsonValue, FetchError> {
        let endpoint = redact_url(url);
        let span = info_span!("http_fetch", %run_id, source_id, url = %endpoint);

        async move {
            let resp = self
                .client
                .get(url.clone())
                .query(query)
                .header(CONTENT_TYPE, "application/json")
                .send()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: endpoint,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?;
            debug!(bytes = body.len(), "response received");

            serde_json::from_slice(&body).map_err(|source| FetchError::MalformedBody {
                url: endpoint,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid table name {0:?}")]
    InvalidTable(String),
    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("creating table {table} failed: {source}")]
    Schema {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("query on {table} failed: {source}")]
    Query {
        table: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("table {0} does not exist")]
    MissingTable(String),
}

/// Table names are interpolated into DDL, so only plain identifiers are accepted.
pub fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let mut chars = table.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}

/// Destination table for normalized APOD records.
#[async_trait]
pub trait ApodStore: Send + Sync {
    fn table(&self) -> &str;

    /// Creates the table when absent. Safe to call on every run.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Atomically inserts unless a row with the same date already exists.
    async fn insert_if_absent(
        &self,
        date: NaiveDate,
        record: &ApodRecord,
    ) -> Result<LoadOutcome, StoreError>;

    async fn count(&self) -> Result<i64, StoreError>;

    async fn count_for_date(&self, date: NaiveDate) -> Result<i64, StoreError>;

    /// Most recently dated row, if any.
    async fn latest(&self) -> Result<Option<ApodRow>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgApodStore {
    pool: PgPool,
    table: String,
}

impl PgApodStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, StoreError> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { pool, table })
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        table: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        Self::new(pool, table)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn query_error(&self, source: sqlx::Error) -> StoreError {
        StoreError::Query {
            table: self.table.clone(),
            source,
        }
    }
}

fn is_already_exists(err: &sqlx::Error) -> bool {
    // 42P07 duplicate_table; 23505 is raised on pg_type when two sessions race the same CREATE.
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "42P07" || code == "23505")
}

#[async_trait]
impl ApodStore for PgApodStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id SERIAL PRIMARY KEY,
                title VARCHAR(500),
                explanation TEXT,
                url TEXT,
                hdurl TEXT,
                date DATE UNIQUE,
                media_type VARCHAR(50),
                copyright VARCHAR(255),
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            self.table
        );

        match sqlx::query(&ddl).execute(&self.pool).await {
            Ok(_) => {}
            Err(err) if is_already_exists(&err) => {
                debug!(table = %self.table, "table created concurrently");
            }
            Err(source) => {
                return Err(StoreError::Schema {
                    table: self.table.clone(),
                    source,
                })
            }
        }
        info!(table = %self.table, "table created successfully or already exists");
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        date: NaiveDate,
        record: &ApodRecord,
    ) -> Result<LoadOutcome, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {} (title, explanation, url, hdurl, date, media_type, copyright)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (date) DO NOTHING
            RETURNING id
            "#,
            self.table
        );

        let id: Option<i32> = sqlx::query_scalar(&sql)
            .bind(&record.title)
            .bind(&record.explanation)
            .bind(&record.url)
            .bind(&record.hdurl)
            .bind(date)
            .bind(&record.media_type)
            .bind(&record.copyright)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.query_error(e))?;

        Ok(match id {
            Some(id) => LoadOutcome::Inserted { id },
            None => LoadOutcome::AlreadyExists,
        })
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.query_error(e))
    }

    async fn count_for_date(&self, date: NaiveDate) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE date = $1", self.table);
        sqlx::query_scalar(&sql)
            .bind(date)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.query_error(e))
    }

    async fn latest(&self) -> Result<Option<ApodRow>, StoreError> {
        let sql = format!(
            r#"
            SELECT id, title, explanation, url, hdurl, date, media_type, copyright, created_at
              FROM {}
             WHERE date IS NOT NULL
             ORDER BY date DESC
             LIMIT 1
            "#,
            self.table
        );
        let Some(row) = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.query_error(e))?
        else {
            return Ok(None);
        };

        let text = |column: &str| -> Result<String, sqlx::Error> {
            Ok(row.try_get::<Option<String>, _>(column)?.unwrap_or_default())
        };
        let decode = || -> Result<ApodRow, sqlx::Error> {
            Ok(ApodRow {
                id: row.try_get("id")?,
                title: text("title")?,
                explanation: text("explanation")?,
                url: text("url")?,
                hdurl: text("hdurl")?,
                date: row.try_get("date")?,
                media_type: text("media_type")?,
                copyright: text("copyright")?,
                created_at: row.try_get("created_at")?,
            })
        };
        decode().map(Some).map_err(|e| self.query_error(e))
    }
}

/// In-process store with the same contract as [`PgApodStore`]; backs tests and dry runs.
#[derive(Debug)]
pub struct MemoryApodStore {
    table: String,
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    schema_created: bool,
    next_id: i32,
    rows: BTreeMap<NaiveDate, ApodRow>,
}

impl Default for MemoryApodStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryApodStore {
    pub fn new() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub async fn rows(&self) -> Vec<ApodRow> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    pub async fn has_schema(&self) -> bool {
        self.state.lock().await.schema_created
    }

    fn missing(&self) -> StoreError {
        StoreError::MissingTable(self.table.clone())
    }
}

#[async_trait]
impl ApodStore for MemoryApodStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.state.lock().await.schema_created = true;
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        date: NaiveDate,
        record: &ApodRecord,
    ) -> Result<LoadOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if !state.schema_created {
            return Err(self.missing());
        }
        if state.rows.contains_key(&date) {
            return Ok(LoadOutcome::AlreadyExists);
        }
        state.next_id += 1;
        let id = state.next_id;
        let row = ApodRow::from_record(id, date, record, Utc::now().naive_utc());
        state.rows.insert(date, row);
        Ok(LoadOutcome::Inserted { id })
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        if !state.schema_created {
            return Err(self.missing());
        }
        Ok(state.rows.len() as i64)
    }

    async fn count_for_date(&self, date: NaiveDate) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        if !state.schema_created {
            return Err(self.missing());
        }
        Ok(i64::from(state.rows.contains_key(&date)))
    }

    async fn latest(&self) -> Result<Option<ApodRow>, StoreError> {
        let state = self.state.lock().await;
        if !state.schema_created {
            return Err(self.missing());
        }
        Ok(state.rows.values().next_back().cloned())
    }
}
