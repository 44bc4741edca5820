//! Database configuration

use crate::schema::Schema;
use crate::scope::DEFAULT_WARNING_INTERVAL;
use std::path::PathBuf;
use std::time::Duration;

/// SQLite database configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SqliteConfig {
    /// Path to the SQLite database file, or `:memory:`
    pub db_path: PathBuf,
    /// Tables and indexes created when the database opens
    pub schema: Schema,
    pub foreign_keys: bool,
    pub wal_mode: bool,
    pub busy_timeout_ms: u32,
    /// How often a scope that stays open logs an advisory warning
    pub scope_warning_interval: Duration,
}

impl SqliteConfig {
    /// Create a new SQLite config with path and schema
    pub fn new(db_path: impl Into<PathBuf>, schema: Schema) -> Self {
        Self {
            db_path: db_path.into(),
            schema,
            foreign_keys: true,
            wal_mode: false,
            busy_timeout_ms: 5000,
            scope_warning_interval: DEFAULT_WARNING_INTERVAL,
        }
    }

    /// In-memory database, mostly for tests
    pub fn memory(schema: Schema) -> Self {
        Self::new(":memory:", schema)
    }

    pub fn is_memory(&self) -> bool {
        self.db_path.to_str() == Some(":memory:")
    }

    pub fn with_foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }

    pub fn with_wal_mode(mut self, enabled: bool) -> Self {
        self.wal_mode = enabled;
        self
    }

    pub fn with_busy_timeout_ms(mut self, timeout: u32) -> Self {
        self.busy_timeout_ms = timeout;
        self
    }

    pub fn with_scope_warning_interval(mut self, interval: Duration) -> Self {
        self.scope_warning_interval = interval;
        self
    }
}
