//! Connection to the relational catalog, with automatic reconnect/retry on
//! transient failure.

use std::cmp;
use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database, Value as LibsqlValue};
use tokio::sync::Mutex;

use crate::config::DbConfig;

/// Naive exponential backoff, no jitter: `delay(n) = min(start * factor^(n-1), ceiling)`.
///
/// Mirrors the reference stack's own hand-rolled `Backoff` helper rather
/// than reaching for a generic retry combinator, since the formula here is
/// deterministic and the constants are pinned to specific values.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    start: Duration,
    factor: u32,
    ceiling: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(start: Duration, factor: u32, ceiling: Duration) -> Self {
        Self {
            start,
            factor,
            ceiling,
            attempt: 0,
        }
    }

    /// Returns the delay to wait before the next retry and advances the
    /// attempt counter. The first call (attempt 1) returns `start`.
    fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let scaled = self
            .start
            .checked_mul(self.factor.saturating_pow(self.attempt - 1))
            .unwrap_or(self.ceiling);
        cmp::min(scaled, self.ceiling)
    }
}

fn default_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(100), 2, Duration::from_secs(10))
}

/// A single untyped row: column name -> JSON-ish value.
pub type Row = BTreeMap<String, SqlValue>;

/// The narrow set of column types the catalog queries this crate issues ever
/// produce.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Real(v) => Some(*v),
            SqlValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        self.as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn from_libsql(value: LibsqlValue) -> Self {
        match value {
            LibsqlValue::Null => SqlValue::Null,
            LibsqlValue::Integer(i) => SqlValue::Integer(i),
            LibsqlValue::Real(f) => SqlValue::Real(f),
            LibsqlValue::Text(s) => SqlValue::Text(s),
            LibsqlValue::Blob(bytes) => {
                SqlValue::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
        }
    }
}

/// Qualifies `table` with `schema` (`content.film` against a real Postgres
/// catalog) or leaves it bare when `schema` is empty (the SQLite-compatible
/// local/test backing, which has no schema namespace).
pub fn qualify(schema: &str, table: &str) -> String {
    if schema.is_empty() {
        table.to_string()
    } else {
        format!("{schema}.{table}")
    }
}

/// Formats a timestamp the way every query template in this crate embeds one:
/// a quoted RFC 3339 literal.
pub fn sql_timestamp(value: DateTime<Utc>) -> String {
    format!("'{}'", value.to_rfc3339())
}

/// Formats a list of UUIDs as a parenthesized, comma-separated, quoted `IN`
/// list. Empty input is the caller's responsibility to special-case (an
/// empty `IN ()` is invalid SQL, so an empty id set must skip the query
/// entirely).
pub fn sql_uuid_list(ids: impl IntoIterator<Item = uuid::Uuid>) -> String {
    ids.into_iter()
        .map(|id| format!("'{id}'"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Holds one connection to the relational catalog and retries transient
/// failures with exponential backoff. Permanent errors (bad SQL, auth
/// failure) retry the same way - distinguishing them is left to operator
/// log monitoring, not to the executor.
pub struct SqlExecutor {
    db: Database,
    conn: Mutex<Connection>,
}

impl SqlExecutor {
    /// Connects to a remote libsql-compatible endpoint built from the
    /// catalog's host/port, authenticating with `password` as the bearer
    /// token.
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let url = format!("https://{}:{}/{}", config.host, config.port, config.name);
        Self::connect_url(&url, &config.password).await
    }

    async fn connect_url(url: &str, auth_token: &str) -> Result<Self> {
        let db = Builder::new_remote(url.to_string(), auth_token.to_string())
            .build()
            .await
            .with_context(|| format!("connecting to catalog at {url}"))?;
        let conn = db.connect().context("opening catalog connection")?;
        Ok(Self {
            db,
            conn: Mutex::new(conn),
        })
    }

    /// Opens a local (file-backed or `:memory:`) database. Used by tests and
    /// by any deployment where the catalog is mirrored into a local
    /// SQLite-compatible file rather than addressed over the network.
    pub async fn open_local(path: &str) -> Result<Self> {
        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening local catalog database at {path}"))?;
        let conn = db.connect().context("opening catalog connection")?;
        Ok(Self {
            db,
            conn: Mutex::new(conn),
        })
    }

    /// Runs `query` and collects every row. On a transport/protocol error
    /// the connection is discarded, a fresh one opened, and the query
    /// retried after an exponentially growing sleep. Retries never give up;
    /// the caller (the outer CLI loop) is responsible for terminating the
    /// process if the catalog is down for good.
    pub async fn execute(&self, query: &str) -> Result<Vec<Row>> {
        let mut backoff = default_backoff();
        loop {
            let attempt_result = self.try_execute(query).await;
            match attempt_result {
                Ok(rows) => return Ok(rows),
                Err(err) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        attempt = backoff.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "catalog query failed, retrying after backoff"
                    );
                    self.reset_connection().await?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_execute(&self, query: &str) -> Result<Vec<Row>> {
        let conn = self.conn.lock().await;
        let mut rows = conn.query(query, ()).await.context("executing query")?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.context("fetching row")? {
            let mut record = Row::new();
            for idx in 0..rows.column_count() {
                let name = rows
                    .column_name(idx)
                    .unwrap_or("")
                    .to_string();
                let value = row
                    .get_value(idx)
                    .with_context(|| format!("reading column {idx}"))?;
                record.insert(name, SqlValue::from_libsql(value));
            }
            out.push(record);
        }
        Ok(out)
    }

    async fn reset_connection(&self) -> Result<()> {
        let fresh = self.db.connect().context("reconnecting to catalog")?;
        *self.conn.lock().await = fresh;
        Ok(())
    }
}
