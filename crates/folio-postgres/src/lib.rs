//! PostgreSQL-backed stores for multi-tenant Folio deployments
//!
//! Every tenant gets its own PostgreSQL schema and login-less role. Admin
//! data (tenants, categories, schema families, the migration ledger) lives
//! in one admin schema; tenant data lives in the tenant's schema and is only
//! touched inside a transaction that has switched to the tenant's role.
//!
//! # Features
//! - Transaction-scoped role and `search_path` switching (`SET LOCAL` semantics)
//! - Append-only version chains for tenants, schemas and entities
//! - Per-entity write serialization on advisory transaction locks
//! - JSON-Schema validation of entity payloads before any write
//! - Prometheus metrics for every store operation
//!
//! # Example
//! ```no_run
//! # use folio_postgres::{PostgresStoreConfig, PostgresStores};
//! # use folio_core::TenantStore;
//! # async fn example() -> folio_core::Result<()> {
//! let stores = PostgresStores::connect(
//!     "postgres://localhost/folio",
//!     PostgresStoreConfig::default(),
//! )
//! .await?;
//! let tenants = stores.tenants().list_tenants(false).await?;
//! # Ok(())
//! # }
//! ```

pub mod category_store;
pub mod config;
pub mod entity_store;
pub mod errors;
pub mod metrics;
pub mod migrations;
pub mod schema_store;
pub mod space_db;
pub mod tenant_store;
pub mod user_store;

pub use category_store::PostgresCategoryStore;
pub use config::{DEFAULT_ADMIN_SCHEMA, PostgresStoreConfig};
pub use entity_store::PostgresEntityStore;
pub use metrics::StoreMetrics;
pub use migrations::run_migrations;
pub use schema_store::PostgresSchemaStore;
pub use space_db::{Scope, ScopedTx, SpaceDb};
pub use tenant_store::PostgresTenantStore;
pub use user_store::PostgresUserStore;

use folio_core::{Result, SchemaStore, SchemaValidator};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Every store of one deployment, sharing a pool and a validator cache
#[derive(Clone)]
pub struct PostgresStores {
    db: SpaceDb,
    schemas: Arc<PostgresSchemaStore>,
    tenants: PostgresTenantStore,
    categories: PostgresCategoryStore,
    users: Arc<PostgresUserStore>,
    validator: Arc<SchemaValidator>,
}

impl PostgresStores {
    /// Connect and bring the admin schema up to date
    pub async fn connect(database_url: &str, config: PostgresStoreConfig) -> Result<Self> {
        let db = SpaceDb::connect(database_url, config).await?;
        Self::open(db).await
    }

    /// Build on an existing pool (useful for testing)
    pub async fn from_pool(pool: PgPool, config: PostgresStoreConfig) -> Result<Self> {
        let db = SpaceDb::from_pool(pool, config)?;
        Self::open(db).await
    }

    async fn open(db: SpaceDb) -> Result<Self> {
        let applied = run_migrations(&db).await?;
        info!(
            "Folio stores ready on admin schema {} ({} migrations applied)",
            db.admin_schema(),
            applied
        );

        Ok(Self {
            schemas: Arc::new(PostgresSchemaStore::new(db.clone())),
            tenants: PostgresTenantStore::new(db.clone()),
            categories: PostgresCategoryStore::new(db.clone()),
            users: Arc::new(PostgresUserStore::new(db.clone())),
            validator: Arc::new(SchemaValidator::new()),
            db,
        })
    }

    pub fn db(&self) -> &SpaceDb {
        &self.db
    }

    pub fn schemas(&self) -> &PostgresSchemaStore {
        &self.schemas
    }

    pub fn tenants(&self) -> &PostgresTenantStore {
        &self.tenants
    }

    pub fn categories(&self) -> &PostgresCategoryStore {
        &self.categories
    }

    pub fn users(&self) -> &PostgresUserStore {
        &self.users
    }

    pub fn validator(&self) -> &SchemaValidator {
        &self.validator
    }

    pub fn metrics(&self) -> &StoreMetrics {
        self.db.metrics()
    }

    /// Entity repository for one schema family, bound to its active table
    pub async fn entity_repository(&self, schema_id: Uuid) -> Result<PostgresEntityStore> {
        let schemas: Arc<dyn SchemaStore> = self.schemas.clone();
        PostgresEntityStore::new(self.db.clone(), schemas, self.validator.clone(), schema_id).await
    }
}
