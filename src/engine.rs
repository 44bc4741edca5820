//! SQL execution capability consumed by the database gate
//!
//! [`Engine`] is the seam between scope admission and the actual connection.
//! [`SqliteEngine`] implements it over a single rusqlite connection; rusqlite
//! is synchronous, so every call runs on Tokio's blocking pool.

use crate::config::SqliteConfig;
use crate::error::{SqliteError, SqliteResult};
use crate::value::{Params, Value};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::ToSql;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A result row keyed by column name
pub type Row = HashMap<String, Value>;

/// Outcome of a statement that does not return rows
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    pub changes: usize,
    pub last_insert_rowid: i64,
}

/// Raw SQL execution against one connection
#[async_trait]
pub trait Engine: Send + Sync {
    async fn run(&self, sql: &str, params: &Params) -> SqliteResult<RunResult>;

    async fn get(&self, sql: &str, params: &Params) -> SqliteResult<Option<Row>>;

    async fn all(&self, sql: &str, params: &Params) -> SqliteResult<Vec<Row>>;

    /// Compile `sql` once so that later executions only bind parameters
    async fn prepare(&self, sql: &str) -> SqliteResult<Arc<dyn Statement>>;
}

/// A prepared statement bound to the engine that prepared it
#[async_trait]
pub trait Statement: Send + Sync {
    fn sql(&self) -> &str;

    async fn run(&self, params: &Params) -> SqliteResult<RunResult>;

    async fn get(&self, params: &Params) -> SqliteResult<Option<Row>>;

    async fn all(&self, params: &Params) -> SqliteResult<Vec<Row>>;
}

/// Thread-safe wrapper around the single SQLite connection
#[derive(Clone)]
pub struct SqliteEngine {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEngine {
    /// Open the connection described by `config` and apply its pragmas
    pub fn open(config: &SqliteConfig) -> SqliteResult<Self> {
        info!(path = ?config.db_path, "opening SQLite connection");

        let conn = if config.is_memory() {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = config.db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        SqliteError::Connection(format!("failed to create directory: {}", e))
                    })?;
                }
            }
            Connection::open(&config.db_path)?
        };

        configure_pragmas(&conn, config)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Execute a closure with the connection on the current thread
    pub fn with_connection<F, T>(&self, f: F) -> SqliteResult<T>
    where
        F: FnOnce(&Connection) -> SqliteResult<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    async fn blocking<F, T>(&self, f: F) -> SqliteResult<T>
    where
        F: FnOnce(&Connection) -> SqliteResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl Engine for SqliteEngine {
    async fn run(&self, sql: &str, params: &Params) -> SqliteResult<RunResult> {
        let sql = sql.to_string();
        let params = params.clone();
        self.blocking(move |conn| execute(conn, &sql, &params)).await
    }

    async fn get(&self, sql: &str, params: &Params) -> SqliteResult<Option<Row>> {
        let sql = sql.to_string();
        let params = params.clone();
        self.blocking(move |conn| Ok(query(conn, &sql, &params, Some(1))?.into_iter().next()))
            .await
    }

    async fn all(&self, sql: &str, params: &Params) -> SqliteResult<Vec<Row>> {
        let sql = sql.to_string();
        let params = params.clone();
        self.blocking(move |conn| query(conn, &sql, &params, None))
            .await
    }

    async fn prepare(&self, sql: &str) -> SqliteResult<Arc<dyn Statement>> {
        let owned = sql.to_string();
        self.blocking(move |conn| {
            conn.prepare_cached(&owned)?;
            Ok(())
        })
        .await?;
        debug!(sql, "statement prepared");
        Ok(Arc::new(SqliteStatement {
            engine: self.clone(),
            sql: sql.to_string(),
        }))
    }
}

/// Statement handle backed by rusqlite's per-connection statement cache
struct SqliteStatement {
    engine: SqliteEngine,
    sql: String,
}

#[async_trait]
impl Statement for SqliteStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    async fn run(&self, params: &Params) -> SqliteResult<RunResult> {
        self.engine.run(&self.sql, params).await
    }

    async fn get(&self, params: &Params) -> SqliteResult<Option<Row>> {
        self.engine.get(&self.sql, params).await
    }

    async fn all(&self, params: &Params) -> SqliteResult<Vec<Row>> {
        self.engine.all(&self.sql, params).await
    }
}

fn configure_pragmas(conn: &Connection, config: &SqliteConfig) -> SqliteResult<()> {
    debug!("configuring SQLite pragmas");

    if config.wal_mode && !config.is_memory() {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    }
    if config.foreign_keys {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    }
    conn.execute_batch(&format!(
        "PRAGMA busy_timeout = {};",
        config.busy_timeout_ms
    ))?;
    Ok(())
}

/// Bindings for the names `stmt` actually references; other names are ignored.
fn named_params<'p>(
    stmt: &rusqlite::Statement<'_>,
    params: &'p Params,
) -> SqliteResult<Vec<(&'p str, &'p dyn ToSql)>> {
    let mut named = Vec::with_capacity(params.len());
    for (name, value) in params.iter() {
        if stmt.parameter_index(name)?.is_some() {
            named.push((name.as_str(), value as &dyn ToSql));
        }
    }
    Ok(named)
}

fn execute(conn: &Connection, sql: &str, params: &Params) -> SqliteResult<RunResult> {
    let mut stmt = conn.prepare_cached(sql)?;
    let named = named_params(&stmt, params)?;
    let changes = stmt.execute(named.as_slice())?;
    Ok(RunResult {
        changes,
        last_insert_rowid: conn.last_insert_rowid(),
    })
}

fn query(
    conn: &Connection,
    sql: &str,
    params: &Params,
    limit: Option<usize>,
) -> SqliteResult<Vec<Row>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();
    let named = named_params(&stmt, params)?;

    let mut rows = stmt.query(named.as_slice())?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Row::with_capacity(columns.len());
        for (index, name) in columns.iter().enumerate() {
            map.insert(name.clone(), Value::from(row.get_ref(index)?));
        }
        result.push(map);
        if limit.is_some_and(|limit| result.len() >= limit) {
            break;
        }
    }
    Ok(result)
}
