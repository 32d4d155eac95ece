//! PostgreSQL backend built on `tokio-postgres`.
//!
//! A fresh connection is opened per call, so the backend can be pointed at
//! any caller-supplied server without pooling state.

use super::{Backend, Dialect, SqlValue, Statement, redact_url, with_timeout};
use crate::decimal::DecimalLiteral;
use crate::error::StorageError;
use async_trait::async_trait;
use bytes::BytesMut;
use std::error::Error;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, Config, NoTls, Row};

type BoxError = Box<dyn Error + Sync + Send>;

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Integer(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                    i.to_string().as_str().to_sql(ty, out)
                }
                _ => i.to_sql(ty, out),
            },
            SqlValue::Number(n) => match *ty {
                Type::FLOAT4 => (*n as f32).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                    n.to_string().as_str().to_sql(ty, out)
                }
                _ => n.to_sql(ty, out),
            },
            // Bound as text and cast to NUMERIC by the placeholder.
            SqlValue::Decimal(d) => match *ty {
                Type::INT2 | Type::INT4 | Type::INT8 => {
                    let literal = DecimalLiteral::parse(d).ok_or("invalid decimal literal")?;
                    SqlValue::Integer(literal.to_i64().ok_or("decimal is not an integer")?)
                        .to_sql(ty, out)
                }
                Type::FLOAT4 | Type::FLOAT8 => SqlValue::Number(d.parse::<f64>()?).to_sql(ty, out),
                _ => d.as_str().to_sql(ty, out),
            },
            SqlValue::Text(s) => s.as_str().to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            *ty,
            Type::INT2
                | Type::INT4
                | Type::INT8
                | Type::FLOAT4
                | Type::FLOAT8
                | Type::TEXT
                | Type::VARCHAR
                | Type::BPCHAR
                | Type::NAME
        )
    }

    to_sql_checked!();
}

/// NUMERIC decoded from the binary wire format into its exact decimal text.
///
/// Layout: ndigits, weight, sign, dscale (all 16-bit), then `ndigits`
/// base-10000 digits, most significant first. `weight` is the power of
/// 10000 of the first digit and `dscale` the number of decimal places.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PgNumeric(pub String);

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        if raw.len() < 8 {
            return Err("numeric value too short".into());
        }
        let read = |at: usize| u16::from_be_bytes([raw[at], raw[at + 1]]);
        let ndigits = read(0) as usize;
        let weight = i64::from(read(2) as i16);
        let sign = read(4);
        let dscale = read(6) as usize;
        match sign {
            NUMERIC_NAN => return Ok(PgNumeric("NaN".to_string())),
            NUMERIC_PINF => return Ok(PgNumeric("Infinity".to_string())),
            NUMERIC_NINF => return Ok(PgNumeric("-Infinity".to_string())),
            _ => {}
        }
        if raw.len() < 8 + ndigits * 2 {
            return Err("numeric digits truncated".into());
        }
        let digit = |i: i64| -> u16 {
            usize::try_from(i)
                .ok()
                .filter(|&i| i < ndigits)
                .map_or(0, |i| read(8 + i * 2))
        };

        let mut text = String::new();
        if sign == NUMERIC_NEG && ndigits > 0 {
            text.push('-');
        }
        if weight < 0 {
            text.push('0');
        } else {
            text.push_str(&digit(0).to_string());
            for i in 1..=weight {
                text.push_str(&format!("{:04}", digit(i)));
            }
        }
        if dscale > 0 {
            let mut fraction = String::with_capacity(dscale + 4);
            let mut i = weight + 1;
            while fraction.len() < dscale {
                fraction.push_str(&format!("{:04}", digit(i)));
                i += 1;
            }
            fraction.truncate(dscale);
            text.push('.');
            text.push_str(&fraction);
        }
        Ok(PgNumeric(text))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

fn decode_row(row: &Row) -> Result<Vec<SqlValue>, StorageError> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = match *ty {
            Type::INT2 => row
                .try_get::<_, Option<i16>>(idx)
                .map(|v| v.map_or(SqlValue::Null, |v| SqlValue::Integer(i64::from(v)))),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(idx)
                .map(|v| v.map_or(SqlValue::Null, |v| SqlValue::Integer(i64::from(v)))),
            Type::INT8 => row
                .try_get::<_, Option<i64>>(idx)
                .map(|v| v.map_or(SqlValue::Null, SqlValue::Integer)),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(idx)
                .map(|v| v.map_or(SqlValue::Null, |v| SqlValue::Number(f64::from(v)))),
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(idx)
                .map(|v| v.map_or(SqlValue::Null, SqlValue::Number)),
            Type::NUMERIC => row
                .try_get::<_, Option<PgNumeric>>(idx)
                .map(|v| v.map_or(SqlValue::Null, |n| SqlValue::Decimal(n.0))),
            Type::BOOL => row
                .try_get::<_, Option<bool>>(idx)
                .map(|v| v.map_or(SqlValue::Null, |b| SqlValue::Text(b.to_string()))),
            _ => row
                .try_get::<_, Option<String>>(idx)
                .map(|v| v.map_or(SqlValue::Null, SqlValue::Text)),
        }
        .map_err(|e| StorageError::Decode {
            column: idx,
            message: format!("{ty}: {e}"),
        })?;
        values.push(value);
    }
    Ok(values)
}

fn map_error(sql: &str, err: tokio_postgres::Error) -> StorageError {
    let message = err
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| err.to_string());
    if let Some(code) = err.code()
        && (*code == SqlState::DUPLICATE_TABLE || *code == SqlState::UNIQUE_VIOLATION)
    {
        return StorageError::Conflict { message };
    }
    tracing::error!(sql = %sql, error = %message, "Error executing statement");
    StorageError::Statement {
        sql: sql.to_string(),
        message,
    }
}

fn param_refs(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// PostgreSQL server reached through a connection URL.
#[derive(Clone)]
pub struct PostgresBackend {
    config: Config,
    display: String,
    timeout: Duration,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("url", &self.display)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PostgresBackend {
    /// Parse a `postgres://` URL. No connection is made until first use.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, StorageError> {
        let display = redact_url(url);
        let mut config: Config = url.parse().map_err(|e| StorageError::Connection {
            message: format!("Invalid PostgreSQL URL {display}: {e}"),
        })?;
        config.connect_timeout(timeout);
        Ok(Self {
            config,
            display,
            timeout,
        })
    }

    /// The connection URL with its password masked.
    pub fn display_url(&self) -> &str {
        &self.display
    }

    async fn client(&self) -> Result<Client, StorageError> {
        let (client, connection) =
            self.config
                .connect(NoTls)
                .await
                .map_err(|e| StorageError::Connection {
                    message: format!("{}: {e}", self.display),
                })?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "PostgreSQL connection closed with error");
            }
        });
        Ok(client)
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StorageError> {
        tracing::debug!(sql = %sql, "SQL statement");
        with_timeout(self.timeout, async {
            let client = self.client().await?;
            client
                .execute(sql, &param_refs(params))
                .await
                .map_err(|e| map_error(sql, e))
        })
        .await
    }

    async fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Vec<SqlValue>>, StorageError> {
        tracing::debug!(sql = %sql, "SQL query");
        with_timeout(self.timeout, async {
            let client = self.client().await?;
            let rows = client
                .query(sql, &param_refs(params))
                .await
                .map_err(|e| map_error(sql, e))?;
            rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    async fn execute_atomic(&self, statements: &[Statement]) -> Result<(), StorageError> {
        with_timeout(self.timeout, async {
            let mut client = self.client().await?;
            let tx = client
                .transaction()
                .await
                .map_err(|e| map_error("BEGIN", e))?;
            for stmt in statements {
                tracing::debug!(sql = %stmt.sql, "SQL statement (transaction)");
                tx.execute(stmt.sql.as_str(), &param_refs(&stmt.params))
                    .await
                    .map_err(|e| map_error(&stmt.sql, e))?;
            }
            tx.commit().await.map_err(|e| map_error("COMMIT", e))
        })
        .await
    }
}
