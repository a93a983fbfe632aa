//! # Message Store
//!
//! Append-only SQLite persistence for received messages, with bulk deletion by age.
//!
//! ```text
//! mqtt(id INTEGER PRIMARY KEY AUTOINCREMENT, ts INTEGER NOT NULL, topic TEXT NOT NULL,
//!      type TEXT, payload BLOB)
//! mqtt_topic ON mqtt(topic)
//! ```
//!
//! `ts` holds milliseconds since the Unix epoch. Schema creation is idempotent, so the
//! store can be reopened on an existing database.

pub mod classify;
pub mod view;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub use classify::{classify, MessageType};
pub use view::MessageView;

/// Upper bound for any query, whatever the caller asks for
pub const MAX_RESULT_LIMIT: usize = 1000;

/// Newest first
pub const DEFAULT_ORDER: &str = "-ts";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS mqtt (
        id      INTEGER PRIMARY KEY AUTOINCREMENT,
        ts      INTEGER NOT NULL,
        topic   TEXT NOT NULL,
        type    TEXT,
        payload BLOB
    );
    CREATE INDEX IF NOT EXISTS mqtt_topic ON mqtt (topic);
";

const COLUMNS: &str = "id, ts, topic, type, payload";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub topic: String,
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl StoredMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let millis: i64 = row.get(1)?;
        let ts = DateTime::from_timestamp_millis(millis)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(1, millis))?;
        Ok(Self {
            id: row.get(0)?,
            ts,
            topic: row.get(2)?,
            message_type: row.get(3)?,
            payload: row.get::<_, Option<Vec<u8>>>(4)?.unwrap_or_default(),
        })
    }
}

impl ToSql for MessageType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MessageType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
    }
}

/// Selection for [`MessageStore::query`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub message_type: Option<MessageType>,
    pub topic: Option<String>,
    /// Field names separated by commas or spaces; a leading `-` sorts descending
    pub order: String,
    /// 0 means the maximum
    pub limit: usize,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            message_type: None,
            topic: None,
            order: DEFAULT_ORDER.to_string(),
            limit: 0,
        }
    }
}

impl Query {
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            0 => MAX_RESULT_LIMIT,
            limit => limit.min(MAX_RESULT_LIMIT),
        }
    }
}

/// Turns an order spec such as `"-ts,topic"` into an `ORDER BY` clause
fn order_clause(spec: &str) -> Result<String> {
    let mut terms = Vec::new();
    for term in spec.split([',', ' ']).map(str::trim).filter(|t| !t.is_empty()) {
        let descending = term.starts_with('-');
        let column = match term.trim_start_matches(['-', '+']) {
            "id" => "id",
            "ts" => "ts",
            "topic" => "topic",
            "type" => "type",
            other => {
                return Err(Error::BadParameter(format!(
                    "cannot order by {:?}",
                    other
                )))
            }
        };
        terms.push(format!(
            "{} {}",
            column,
            if descending { "DESC" } else { "ASC" }
        ));
    }
    if terms.is_empty() {
        return order_clause(DEFAULT_ORDER);
    }
    Ok(terms.join(", "))
}

pub struct MessageStore {
    connection: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl MessageStore {
    /// Opens or creates the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::BadParameter(format!("database directory {}: {}", parent.display(), e))
            })?;
        }
        let connection = Connection::open(path)?;
        info!("Opened message store at {}", path.display());
        Self::with_connection(connection, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(connection: Connection, path: Option<PathBuf>) -> Result<Self> {
        connection.execute_batch(SCHEMA)?;
        Ok(Self {
            connection: Mutex::new(connection),
            path,
        })
    }

    /// Location of the database, `None` for an in-memory store
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a message and returns its id
    pub fn insert(
        &self,
        ts: DateTime<Utc>,
        topic: &str,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<i64> {
        let connection = self.connection();
        connection.execute(
            "INSERT INTO mqtt (ts, topic, type, payload) VALUES (?1, ?2, ?3, ?4)",
            params![ts.timestamp_millis(), topic, message_type, payload],
        )?;
        Ok(connection.last_insert_rowid())
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .connection()
            .query_row("SELECT COUNT(*) FROM mqtt", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Deletes messages older than `window` and returns how many were removed
    pub fn sweep(&self, window: Duration) -> Result<usize> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| Error::BadParameter(format!("retention window: {}", e)))?;
        self.sweep_before(Utc::now() - window)
    }

    /// Deletes messages stamped strictly before `cutoff`
    pub fn sweep_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let deleted = self.connection().execute(
            "DELETE FROM mqtt WHERE ts < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        if deleted > 0 {
            debug!("Retention sweep removed {} messages before {}", deleted, cutoff);
        }
        Ok(deleted)
    }

    pub fn query(&self, query: &Query) -> Result<Vec<StoredMessage>> {
        let order = order_clause(&query.order)?;
        let limit = query.effective_limit() as i64;

        let mut conditions = Vec::new();
        let mut values: Vec<&dyn ToSql> = Vec::new();
        if let Some(message_type) = &query.message_type {
            values.push(message_type);
            conditions.push(format!("type = ?{}", values.len()));
        }
        if let Some(topic) = &query.topic {
            values.push(topic);
            conditions.push(format!("topic = ?{}", values.len()));
        }
        values.push(&limit);
        let filter = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM mqtt{} ORDER BY {} LIMIT ?{}",
            COLUMNS,
            filter,
            order,
            values.len()
        );

        let connection = self.connection();
        let mut statement = connection.prepare(&sql)?;
        let rows = statement.query_map(values.as_slice(), StoredMessage::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get(&self, id: i64) -> Result<StoredMessage> {
        let sql = format!("SELECT {} FROM mqtt WHERE id = ?1", COLUMNS);
        self.connection()
            .query_row(&sql, params![id], StoredMessage::from_row)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("message {}", id)))
    }
}
