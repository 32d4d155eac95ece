//! Embedded SQLite backend built on `rusqlite`.
//!
//! The connection is shared behind a mutex and every call runs on the
//! blocking thread pool. A call that outlives the statement timeout is
//! abandoned: it is skipped if it has not started yet, and interrupted
//! (rolling back any open transaction) if it is running.

use super::{Backend, Dialect, SqlValue, Statement, with_timeout};
use crate::decimal::DecimalLiteral;
use crate::error::StorageError;
use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, ErrorCode, InterruptHandle, params_from_iter};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Number(n) => ToSqlOutput::Owned(Value::Real(*n)),
            // SQLite has no exact NUMERIC storage; the column affinity turns
            // the value into REAL (or INTEGER when it is integral) anyway.
            SqlValue::Decimal(d) => match DecimalLiteral::parse(d) {
                Some(literal) => ToSqlOutput::Owned(Value::Real(literal.to_f64())),
                None => ToSqlOutput::Borrowed(ValueRef::Text(d.as_bytes())),
            },
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Number(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Text(String::from_utf8_lossy(b).into_owned()),
    }
}

fn map_error(sql: &str, err: rusqlite::Error) -> StorageError {
    if let rusqlite::Error::SqliteFailure(code, message) = &err {
        let message = message.clone().unwrap_or_default();
        let unique = code.code == ErrorCode::ConstraintViolation
            && message.to_ascii_uppercase().contains("UNIQUE");
        if unique || message.contains("already exists") {
            return StorageError::Conflict { message };
        }
    }
    tracing::error!(sql = %sql, error = %err, "Error executing statement");
    StorageError::Statement {
        sql: sql.to_string(),
        message: err.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Queued,
    Running,
    Finished,
    Abandoned,
}

/// Lifecycle of one blocking call, shared with the task awaiting it.
#[derive(Debug)]
struct Call {
    state: Mutex<CallState>,
}

impl Call {
    fn new() -> Self {
        Self {
            state: Mutex::new(CallState::Queued),
        }
    }

    fn transition(&self, from: CallState, to: CallState) -> bool {
        match self.state.lock() {
            Ok(mut state) if *state == from => {
                *state = to;
                true
            }
            _ => false,
        }
    }

    /// Claim the call for execution; false once it was abandoned.
    fn start(&self) -> bool {
        self.transition(CallState::Queued, CallState::Running)
    }

    fn finish(&self) {
        self.transition(CallState::Running, CallState::Finished);
    }

    fn is_abandoned(&self) -> bool {
        self.state
            .lock()
            .map(|state| *state == CallState::Abandoned)
            .unwrap_or(true)
    }

    /// Give up on the call. A running call is interrupted while the state
    /// lock is held, so the interrupt cannot land on a later call.
    fn abandon(&self, interrupt: &InterruptHandle) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let was = *state;
        match was {
            CallState::Queued => *state = CallState::Abandoned,
            CallState::Running => {
                *state = CallState::Abandoned;
                interrupt.interrupt();
            }
            CallState::Finished | CallState::Abandoned => {}
        }
        was == CallState::Running
    }
}

/// SQLite database reached through a single shared connection.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    location: String,
    timeout: Duration,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("location", &self.location)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SqliteBackend {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create {}: {e}", parent.display()),
            })?;
        }
        let conn = Connection::open(path).map_err(|e| StorageError::Connection {
            message: format!("Failed to open {}: {e}", path.display()),
        })?;
        Self::from_connection(conn, path.display().to_string(), timeout)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(timeout: Duration) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::Connection {
            message: format!("Failed to open in-memory database: {e}"),
        })?;
        Self::from_connection(conn, ":memory:".to_string(), timeout)
    }

    fn from_connection(
        conn: Connection,
        location: String,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        conn.busy_timeout(timeout)
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to configure {location}: {e}"),
            })?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            location,
            timeout,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    async fn run<T, F>(&self, label: String, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &Call) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let call = Arc::new(Call::new());
        let worker_call = Arc::clone(&call);
        let timed_out = StorageError::Timeout {
            timeout_secs: self.timeout.as_secs(),
        };
        let join_label = label.clone();

        let result = with_timeout(self.timeout, async move {
            tokio::task::spawn_blocking(move || {
                let mut guard = conn.lock().map_err(|_| StorageError::Connection {
                    message: "SQLite connection mutex poisoned".to_string(),
                })?;
                if !worker_call.start() {
                    return Err(timed_out);
                }
                let result = f(&mut guard, &worker_call);
                worker_call.finish();
                result
            })
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("SQLite task join error while running {join_label}: {e}"),
            })?
        })
        .await;

        if matches!(result, Err(StorageError::Timeout { .. })) {
            let interrupted = call.abandon(&self.interrupt);
            tracing::warn!(sql = %label, interrupted, "SQLite call abandoned after timeout");
        }
        result
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StorageError> {
        tracing::debug!(sql = %sql, "SQL statement");
        let sql = sql.to_string();
        let params = params.to_vec();
        self.run(sql.clone(), move |conn, _| {
            conn.execute(&sql, params_from_iter(params.iter()))
                .map(|n| n as u64)
                .map_err(|e| map_error(&sql, e))
        })
        .await
    }

    async fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<Vec<SqlValue>>, StorageError> {
        tracing::debug!(sql = %sql, "SQL query");
        let sql = sql.to_string();
        let params = params.to_vec();
        self.run(sql.clone(), move |conn, _| {
            let mut stmt = conn.prepare(&sql).map_err(|e| map_error(&sql, e))?;
            let column_count = stmt.column_count();
            let mut rows = stmt
                .query(params_from_iter(params.iter()))
                .map_err(|e| map_error(&sql, e))?;

            let mut result = Vec::new();
            while let Some(row) = rows.next().map_err(|e| map_error(&sql, e))? {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    let value = row.get_ref(i).map_err(|e| StorageError::Decode {
                        column: i,
                        message: e.to_string(),
                    })?;
                    values.push(from_value_ref(value));
                }
                result.push(values);
            }
            Ok(result)
        })
        .await
    }

    async fn execute_atomic(&self, statements: &[Statement]) -> Result<(), StorageError> {
        let statements = statements.to_vec();
        let timeout_secs = self.timeout.as_secs();
        self.run("transaction".to_string(), move |conn, call| {
            let tx = conn.transaction().map_err(|e| map_error("BEGIN", e))?;
            for stmt in &statements {
                tracing::debug!(sql = %stmt.sql, "SQL statement (transaction)");
                tx.execute(&stmt.sql, params_from_iter(stmt.params.iter()))
                    .map_err(|e| map_error(&stmt.sql, e))?;
            }
            // Interrupts only reach running statements; the gap before
            // COMMIT is covered here. Dropping `tx` rolls back.
            if call.is_abandoned() {
                return Err(StorageError::Timeout { timeout_secs });
            }
            tx.commit().map_err(|e| map_error("COMMIT", e))
        })
        .await
    }
}
