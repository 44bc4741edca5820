//! Scoped access to a single SQLite connection shared by many callers.
//!
//! # Intention
//!
//! - Give an explicit transaction an exclusive admission window while
//!   operations issued without a scope keep running between transactions.
//! - Compile declarative where-expressions into parameterized SQL.
//!
//! # Architectural Boundaries
//!
//! - [`scope`] and [`scheduler`] decide *when* an operation may touch the engine.
//! - [`predicate`] turns filters into SQL text and bindings.
//! - [`database`] is the gate every operation passes; [`engine`] is the raw
//!   SQL capability behind it.
//! - No pooling and no multi-connection coordination.
//!
//! ```rust,ignore
//! use rust_sqlite_scope::{Database, Params, Schema, SqliteConfig};
//!
//! let db = Database::open(SqliteConfig::memory(Schema::new()))?;
//! let scope = db.new_scope()?;
//! db.begin(Some(&scope)).await?;
//! db.run("INSERT INTO users (name) VALUES (@name)",
//!        &Params::new().with_value("@name", "John"), Some(&scope)).await?;
//! db.commit(Some(&scope)).await?;
//! scope.end();
//! ```

pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod predicate;
pub mod scheduler;
pub mod schema;
pub mod scope;
pub mod table;
pub mod value;

pub use config::SqliteConfig;
pub use database::Database;
pub use engine::{Engine, Row, RunResult, SqliteEngine, Statement};
pub use error::{SqliteError, SqliteResult};
pub use predicate::{compile, compile_json, CompiledWhere, Operator, Predicate};
pub use scheduler::ScopeScheduler;
pub use schema::{
    ColumnConstraint, ColumnDefinition, DataType, DefaultValue, ForeignKey, ForeignKeyAction,
    IndexDefinition, Schema, TableDefinition,
};
pub use scope::{Scope, ScopeKind, ScopeState};
pub use table::{SelectOptions, SqlQuery, Table};
pub use value::{Params, Value};
