//! Scoped transaction runner
//!
//! Every store operation runs in exactly one transaction opened here. A scope
//! carries both isolation boundaries at once: the database role the
//! transaction runs as and the `search_path` it resolves tables through. Both
//! are applied with `set_config(.., true)` so they end with the transaction
//! and never leak into pooled connections.

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::debug;

use crate::config::PostgresStoreConfig;
use crate::errors::db_error;
use crate::metrics::StoreMetrics;
use folio_core::{Error, Result, TenantSpace, ident::quote_ident};

/// Execution scope of one transaction
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    /// Connection role, admin schema only
    Admin,
    /// Tenant role, tenant schema first and admin schema second
    Tenant(&'a TenantSpace),
}

/// An open transaction with its scope applied
///
/// Released by [`commit`](ScopedTx::commit), [`rollback`](ScopedTx::rollback)
/// or drop. Dropping an unfinished scope rolls it back, which is also what
/// happens when the owning future is cancelled.
pub struct ScopedTx {
    tx: Transaction<'static, Postgres>,
}

impl ScopedTx {
    /// Connection to run statements on
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Serialize on `key` until this transaction ends
    pub async fn lock_key(&mut self, key: &str) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key)
            .execute(self.conn())
            .await
            .map_err(|e| db_error("acquire advisory lock", e))?;
        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| db_error("commit transaction", e))
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| db_error("roll back transaction", e))
    }

    /// Commit on `Ok`, roll back on `Err`. The original error is returned
    /// unchanged even if the rollback itself fails.
    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    debug!("Rollback after failed operation also failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }
}

/// Tenant schemas in which a lazily created table is known to exist
///
/// Only marked after the transaction that created the table has committed.
#[derive(Debug, Default)]
pub(crate) struct EnsuredTables {
    schemas: RwLock<HashSet<String>>,
}

impl EnsuredTables {
    pub(crate) fn contains(&self, schema_name: &str) -> bool {
        self.schemas.read().contains(schema_name)
    }

    pub(crate) fn mark(&self, schema_name: &str) {
        if !self.contains(schema_name) {
            self.schemas.write().insert(schema_name.to_string());
        }
    }
}

/// Pool plus the configuration every scope is opened with
#[derive(Clone)]
pub struct SpaceDb {
    pool: PgPool,
    config: PostgresStoreConfig,
    metrics: StoreMetrics,
}

impl SpaceDb {
    /// Connect a new pool
    ///
    /// # Errors
    /// - `Error::Validation` for an invalid configuration
    /// - `Error::Database` if the pool cannot connect
    pub async fn connect(database_url: &str, config: PostgresStoreConfig) -> Result<Self> {
        config.validate()?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(database_url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect to PostgreSQL: {}", e)))?;

        Self::from_pool(pool, config)
    }

    /// Wrap an existing pool (useful for testing)
    pub fn from_pool(pool: PgPool, config: PostgresStoreConfig) -> Result<Self> {
        config.validate()?;
        let metrics = StoreMetrics::new()
            .map_err(|e| Error::Internal(format!("Failed to create store metrics: {}", e)))?;
        Ok(Self {
            pool,
            config,
            metrics,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn admin_schema(&self) -> &str {
        &self.config.admin_schema
    }

    pub fn config(&self) -> &PostgresStoreConfig {
        &self.config
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Await one store operation and record its outcome
    pub(crate) async fn observed<T, Fut>(&self, store: &str, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = fut.await;
        self.metrics.observe(store, operation, started, &result);
        result
    }

    /// Open a transaction with `scope` applied.
    ///
    /// A tenant scope is checked before any connection is taken: a space
    /// without a role fails with `Error::TenantRequired`.
    pub async fn begin(&self, scope: Scope<'_>) -> Result<ScopedTx> {
        let search_path = search_path_for(&self.config.admin_schema, scope)?;

        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;
        let mut scoped = ScopedTx { tx };

        // Role first: search_path is resolved with the privileges of the role
        if let Scope::Tenant(space) = scope {
            set_local(&mut scoped, "role", &space.role_name).await?;
        }
        set_local(&mut scoped, "search_path", &search_path).await?;
        if let Some(timeout) = self.config.statement_timeout {
            set_local(
                &mut scoped,
                "statement_timeout",
                &timeout.as_millis().to_string(),
            )
            .await?;
        }

        Ok(scoped)
    }

    pub async fn begin_admin(&self) -> Result<ScopedTx> {
        self.begin(Scope::Admin).await
    }

    pub async fn begin_tenant(&self, space: &TenantSpace) -> Result<ScopedTx> {
        self.begin(Scope::Tenant(space)).await
    }

    /// Run `f` in an admin scope, committing on success
    pub async fn run_as_admin<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut ScopedTx) -> BoxFuture<'c, Result<T>> + Send,
    {
        let tx = self.begin(Scope::Admin).await?;
        run_scoped(tx, f).await
    }

    /// Run `f` in the scope of `space`, committing on success
    pub async fn run_as_tenant<T, F>(&self, space: &TenantSpace, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut ScopedTx) -> BoxFuture<'c, Result<T>> + Send,
    {
        let tx = self.begin(Scope::Tenant(space)).await?;
        run_scoped(tx, f).await
    }
}

async fn run_scoped<T, F>(mut tx: ScopedTx, f: F) -> Result<T>
where
    F: for<'c> FnOnce(&'c mut ScopedTx) -> BoxFuture<'c, Result<T>>,
{
    let result = match AssertUnwindSafe(f(&mut tx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Error::Internal(format!(
            "Scoped operation panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };
    tx.finish(result).await
}

async fn set_local(tx: &mut ScopedTx, setting: &str, value: &str) -> Result<()> {
    sqlx::query("SELECT set_config($1, $2, true)")
        .bind(setting)
        .bind(value)
        .execute(tx.conn())
        .await
        .map_err(|e| db_error(&format!("set {}", setting), e))?;
    Ok(())
}

/// `search_path` value for a scope. Tenant names are validated first.
fn search_path_for(admin_schema: &str, scope: Scope<'_>) -> Result<String> {
    match scope {
        Scope::Admin => Ok(quote_ident(admin_schema)),
        Scope::Tenant(space) => {
            space.validate()?;
            Ok(format!(
                "{}, {}",
                quote_ident(&space.schema_name),
                quote_ident(admin_schema)
            ))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
