//! Gated access to the shared engine
//!
//! Every operation goes through the same gate before it reaches the engine:
//! wait for all registered initializers, then wait for the target scope (the
//! explicit one, or the current community scope) to start.

use crate::config::SqliteConfig;
use crate::engine::{Engine, Row, RunResult, SqliteEngine, Statement};
use crate::error::{SqliteError, SqliteResult};
use crate::scheduler::ScopeScheduler;
use crate::scope::Scope;
use crate::table::Table;
use crate::value::Params;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

type Initializer = Shared<BoxFuture<'static, Result<(), String>>>;

struct TransactionStatements {
    begin: Arc<dyn Statement>,
    commit: Arc<dyn Statement>,
    rollback: Arc<dyn Statement>,
}

/// Handle to one engine connection shared by many callers; clones share it
#[derive(Clone)]
pub struct Database {
    engine: Arc<dyn Engine>,
    scheduler: ScopeScheduler,
    initializers: Arc<Mutex<Vec<Initializer>>>,
    transaction: Arc<OnceCell<TransactionStatements>>,
}

impl Database {
    /// Open a SQLite database and register its schema as an initializer
    pub fn open(config: SqliteConfig) -> SqliteResult<Self> {
        let statements = config.schema.to_statements()?;
        let engine = SqliteEngine::open(&config)?;
        let db = Self::with_engine(Arc::new(engine.clone()), config.scope_warning_interval);

        if !statements.is_empty() {
            db.add_initializer(async move {
                for sql in &statements {
                    engine.run(sql, &Params::new()).await?;
                }
                info!(statements = statements.len(), "schema applied");
                Ok(())
            });
        }
        Ok(db)
    }

    /// Wrap an arbitrary engine
    pub fn with_engine(engine: Arc<dyn Engine>, warning_interval: Duration) -> Self {
        Self {
            engine,
            scheduler: ScopeScheduler::new(warning_interval),
            initializers: Arc::new(Mutex::new(Vec::new())),
            transaction: Arc::new(OnceCell::new()),
        }
    }

    /// Register work every later operation waits for before it runs
    pub fn add_initializer<F>(&self, init: F)
    where
        F: Future<Output = SqliteResult<()>> + Send + 'static,
    {
        let shared = init.map(|res| res.map_err(|e| e.to_string())).boxed().shared();
        self.initializers.lock().push(shared);
    }

    /// Wait for every registered initializer
    pub async fn ready(&self) -> SqliteResult<()> {
        let pending = self.initializers.lock().clone();
        for init in pending {
            init.await.map_err(SqliteError::Initialization)?;
        }
        Ok(())
    }

    async fn gate(&self, scope: Option<&Scope>) -> SqliteResult<Scope> {
        self.ready().await?;
        self.scheduler.wait_scope_start(scope).await
    }

    pub fn scheduler(&self) -> &ScopeScheduler {
        &self.scheduler
    }

    /// Request a dedicated scope for a transaction; the caller ends it
    pub fn new_scope(&self) -> SqliteResult<Scope> {
        self.scheduler.new_scope()
    }

    pub fn table(&self, name: &str) -> SqliteResult<Table> {
        Table::new(self.clone(), name)
    }

    pub async fn run(
        &self,
        sql: &str,
        params: &Params,
        scope: Option<&Scope>,
    ) -> SqliteResult<RunResult> {
        let scope = self.gate(scope).await?;
        debug!(scope_id = scope.id(), sql, "run");
        self.engine.run(sql, params).await
    }

    pub async fn get(
        &self,
        sql: &str,
        params: &Params,
        scope: Option<&Scope>,
    ) -> SqliteResult<Option<Row>> {
        let scope = self.gate(scope).await?;
        debug!(scope_id = scope.id(), sql, "get");
        self.engine.get(sql, params).await
    }

    pub async fn all(
        &self,
        sql: &str,
        params: &Params,
        scope: Option<&Scope>,
    ) -> SqliteResult<Vec<Row>> {
        let scope = self.gate(scope).await?;
        debug!(scope_id = scope.id(), sql, "all");
        self.engine.all(sql, params).await
    }

    /// Prepare a statement. Executions of the returned handle are not gated;
    /// run them only while holding a started scope.
    pub async fn prepare(
        &self,
        sql: &str,
        scope: Option<&Scope>,
    ) -> SqliteResult<Arc<dyn Statement>> {
        self.gate(scope).await?;
        self.engine.prepare(sql).await
    }

    pub async fn begin(&self, scope: Option<&Scope>) -> SqliteResult<()> {
        let scope = self.gate(scope).await?;
        debug!(scope_id = scope.id(), "begin transaction");
        self.transaction_statements()
            .await?
            .begin
            .run(&Params::new())
            .await
            .map(|_| ())
    }

    /// Commit; the scope stays open until the caller ends it
    pub async fn commit(&self, scope: Option<&Scope>) -> SqliteResult<()> {
        let scope = self.gate(scope).await?;
        debug!(scope_id = scope.id(), "commit transaction");
        self.transaction_statements()
            .await?
            .commit
            .run(&Params::new())
            .await
            .map(|_| ())
    }

    /// Roll back; the scope stays open until the caller ends it
    pub async fn rollback(&self, scope: Option<&Scope>) -> SqliteResult<()> {
        let scope = self.gate(scope).await?;
        debug!(scope_id = scope.id(), "rollback transaction");
        self.transaction_statements()
            .await?
            .rollback
            .run(&Params::new())
            .await
            .map(|_| ())
    }

    /// Refuse new scopes and wait until every outstanding scope has ended
    pub async fn close(&self) {
        let pending = self.scheduler.pending_len();
        if pending > 0 {
            warn!(pending, "closing database with open scopes; waiting for them to end");
        }
        self.scheduler.close().await;
        info!("database closed");
    }

    async fn transaction_statements(&self) -> SqliteResult<&TransactionStatements> {
        self.transaction
            .get_or_try_init(|| async {
                Ok::<_, SqliteError>(TransactionStatements {
                    begin: self.engine.prepare("BEGIN").await?,
                    commit: self.engine.prepare("COMMIT").await?,
                    rollback: self.engine.prepare("ROLLBACK").await?,
                })
            })
            .await
    }
}
