//! SQL execution backends.
//!
//! Every statement issued by the catalog, ingestor and query engine goes
//! through the [`Backend`] trait. Values are always bound as parameters;
//! identifiers are interpolated and must already be sanitized.

mod postgres;
mod sqlite;

pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

use crate::decimal::DecimalLiteral;
use crate::error::StorageError;
use async_trait::async_trait;
use serde::{Serialize, Serializer};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A single scalar crossing the SQL boundary.
///
/// `Decimal` holds exact NUMERIC text (`-12.50`, `1e3`) and serializes as a
/// bare JSON number; `Number` is a REAL as returned by SQLite.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Number(f64),
    Decimal(String),
    Text(String),
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SqlValue::Null => serializer.serialize_unit(),
            SqlValue::Integer(i) => serializer.serialize_i64(*i),
            SqlValue::Number(n) => serializer.serialize_f64(*n),
            SqlValue::Decimal(d) => match serde_json::value::RawValue::from_string(d.clone()) {
                Ok(raw) => raw.serialize(serializer),
                Err(_) => serializer.serialize_str(d),
            },
            SqlValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Decimal(d) => DecimalLiteral::parse(d)?.to_i64(),
            SqlValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => Ok(()),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Number(n) => write!(f, "{n}"),
            SqlValue::Decimal(d) => f.write_str(d),
            SqlValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// A statement with its bound parameters.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// The SQL engine a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Placeholder text for the `n`-th (1-based) bound parameter.
    pub fn placeholder(self, n: usize, value: &SqlValue) -> String {
        match self {
            Dialect::Postgres => match value {
                SqlValue::Integer(_) => format!("${n}::int8"),
                SqlValue::Number(_) => format!("${n}::float8"),
                SqlValue::Decimal(_) => format!("${n}::text::numeric"),
                SqlValue::Text(_) => format!("${n}::text"),
                SqlValue::Null => format!("${n}"),
            },
            Dialect::Sqlite => format!("?{n}"),
        }
    }

    /// DDL for the catalog registry relation.
    pub fn catalog_ddl(self, catalog_table: &str) -> String {
        match self {
            Dialect::Postgres => format!(
                "CREATE TABLE IF NOT EXISTS {catalog_table} (\
                 dataset_id SERIAL PRIMARY KEY, \
                 table_name VARCHAR (50) UNIQUE NOT NULL, \
                 column_definitions TEXT NOT NULL, \
                 created TIMESTAMP DEFAULT NOW())"
            ),
            Dialect::Sqlite => format!(
                "CREATE TABLE IF NOT EXISTS {catalog_table} (\
                 dataset_id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 table_name VARCHAR (50) UNIQUE NOT NULL, \
                 column_definitions TEXT NOT NULL, \
                 created TIMESTAMP DEFAULT CURRENT_TIMESTAMP)"
            ),
        }
    }

    /// Query counting tables with the name bound as the first parameter.
    pub fn table_exists_sql(self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_name = $1::text"
            }
            Dialect::Sqlite => "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        }
    }
}

/// Collects parameters while a statement is being rendered.
///
/// Nulls are rendered as a literal `NULL` and never bound, so untyped
/// placeholders never reach the server.
#[derive(Debug)]
pub struct Binder {
    dialect: Dialect,
    params: Vec<SqlValue>,
}

impl Binder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    /// Bind a value and return the SQL text that refers to it.
    pub fn bind(&mut self, value: SqlValue) -> String {
        if value.is_null() {
            return "NULL".to_string();
        }
        let placeholder = self.dialect.placeholder(self.params.len() + 1, &value);
        self.params.push(value);
        placeholder
    }

    pub fn into_params(self) -> Vec<SqlValue> {
        self.params
    }
}

/// Executes SQL against one database.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    fn dialect(&self) -> Dialect;

    /// Run a statement that returns no rows; returns the affected row count.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StorageError>;

    /// Run a query and return every row positionally.
    async fn query(&self, sql: &str, params: &[SqlValue])
    -> Result<Vec<Vec<SqlValue>>, StorageError>;

    /// Run all statements in one transaction, committing only if all succeed.
    async fn execute_atomic(&self, statements: &[Statement]) -> Result<(), StorageError>;
}

pub type SharedBackend = Arc<dyn Backend>;

/// Open a backend for a database URL.
///
/// `postgres://` and `postgresql://` select PostgreSQL; `sqlite://<path>`,
/// `sqlite::memory:` or a bare filesystem path select SQLite.
pub async fn connect(url: &str, timeout: Duration) -> Result<SharedBackend, StorageError> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let backend = PostgresBackend::new(url, timeout)?;
        return Ok(Arc::new(backend));
    }
    if url == "sqlite::memory:" || url == ":memory:" {
        return Ok(Arc::new(SqliteBackend::open_in_memory(timeout)?));
    }
    if let Some(path) = url.strip_prefix("sqlite://") {
        return Ok(Arc::new(SqliteBackend::open(path, timeout)?));
    }
    if url.contains("://") {
        return Err(StorageError::UnsupportedUrl {
            url: redact_url(url),
        });
    }
    Ok(Arc::new(SqliteBackend::open(url, timeout)?))
}

/// Strip the password from a URL before it is logged or displayed.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => raw.to_string(),
    }
}

/// Await a statement future, failing with `StorageError::Timeout` once the
/// budget is exhausted.
pub(crate) async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout {
            timeout_secs: timeout.as_secs(),
        }),
    }
}
