//! Versioned bootstrap migrations for the admin schema
//!
//! Migrations are applied exactly once and in order, tracked by a
//! `schema_migrations` ledger inside the admin schema. Concurrent callers
//! serialize on an advisory lock, so several processes may migrate at startup.

use std::time::Instant;

use folio_core::{Result, ident::quote_ident};
use tracing::{debug, info};

use crate::errors::db_error;
use crate::space_db::{ScopedTx, SpaceDb};

const MIGRATION_LOCK_KEY: &str = "folio:migrations";

/// Represents a single database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Unique version number (must be sequential)
    pub version: i32,
    /// Description of what this migration does
    pub description: &'static str,
    /// SQL to execute for this migration, resolved against the admin schema
    pub up_sql: &'static str,
}

/// All migrations in order
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Create categories table",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS categories (
                category_id UUID PRIMARY KEY,
                parent_id UUID REFERENCES categories(category_id),
                name TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                created_by TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_categories_parent
            ON categories(parent_id)
        "#,
    },
    Migration {
        version: 2,
        description: "Create schema_repository table",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS schema_repository (
                schema_id UUID NOT NULL,
                schema_version TEXT NOT NULL,
                schema_definition JSONB NOT NULL,
                hash TEXT NOT NULL,
                table_name TEXT NOT NULL,
                slug TEXT NOT NULL,
                category_id UUID NOT NULL REFERENCES categories(category_id),
                is_active BOOLEAN NOT NULL DEFAULT FALSE,
                is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                created_by TEXT NOT NULL,

                PRIMARY KEY (schema_id, schema_version)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_schema_repository_active
            ON schema_repository(schema_id) WHERE is_active AND NOT is_deleted;

            CREATE INDEX IF NOT EXISTS idx_schema_repository_table_name
            ON schema_repository(table_name);

            CREATE INDEX IF NOT EXISTS idx_schema_repository_slug
            ON schema_repository(slug)
        "#,
    },
    Migration {
        version: 3,
        description: "Create tenants table",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS tenants (
                tenant_id UUID NOT NULL,
                tenant_version TEXT NOT NULL,
                slug TEXT NOT NULL,
                schema_name TEXT NOT NULL,
                role_name TEXT NOT NULL,
                base_prefix TEXT NOT NULL,

                -- Lifecycle
                status TEXT NOT NULL,
                db_ready BOOLEAN NOT NULL DEFAULT FALSE,
                auth_ready BOOLEAN NOT NULL DEFAULT FALSE,
                last_provisioned_at TIMESTAMPTZ,
                last_error TEXT,

                is_active BOOLEAN NOT NULL DEFAULT FALSE,
                is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                created_by TEXT NOT NULL,

                PRIMARY KEY (tenant_id, tenant_version)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_tenants_active
            ON tenants(tenant_id) WHERE is_active;

            CREATE INDEX IF NOT EXISTS idx_tenants_slug
            ON tenants(slug);

            CREATE INDEX IF NOT EXISTS idx_tenants_schema_name
            ON tenants(schema_name)
        "#,
    },
];

/// Run all pending migrations
///
/// Creates the admin schema and its `schema_migrations` ledger if needed,
/// then applies every migration not yet recorded. Returns how many were
/// applied by this call.
pub async fn run_migrations(db: &SpaceDb) -> Result<usize> {
    create_admin_schema(db).await?;

    let mut tx = db.begin_admin().await?;
    let result = apply_pending(db, &mut tx).await;
    tx.finish(result).await
}

async fn create_admin_schema(db: &SpaceDb) -> Result<()> {
    let mut tx = db.begin_admin().await?;
    let result: Result<()> = async {
        tx.lock_key(MIGRATION_LOCK_KEY).await?;
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(db.admin_schema())
        ))
        .execute(tx.conn())
        .await
        .map_err(|e| db_error("create admin schema", e))?;
        Ok(())
    }
    .await;
    tx.finish(result).await
}

async fn apply_pending(db: &SpaceDb, tx: &mut ScopedTx) -> Result<usize> {
    tx.lock_key(MIGRATION_LOCK_KEY).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(tx.conn())
    .await
    .map_err(|e| db_error("create schema_migrations table", e))?;

    let applied_versions: Vec<i32> = sqlx::query_scalar("SELECT version FROM schema_migrations")
        .fetch_all(tx.conn())
        .await
        .map_err(|e| db_error("fetch applied migrations", e))?;

    debug!(
        "Found {} applied migrations: {:?}",
        applied_versions.len(),
        applied_versions
    );

    let mut applied_now = 0;
    for migration in MIGRATIONS {
        if applied_versions.contains(&migration.version) {
            debug!(
                "Skipping migration {}: {} (already applied)",
                migration.version, migration.description
            );
            continue;
        }

        info!(
            "Applying migration {}: {}",
            migration.version, migration.description
        );
        let started = Instant::now();

        sqlx::raw_sql(migration.up_sql)
            .execute(tx.conn())
            .await
            .map_err(|e| db_error(&format!("apply migration {}", migration.version), e))?;

        sqlx::query(
            "INSERT INTO schema_migrations (version, description) VALUES ($1, $2)
                ON CONFLICT (version) DO NOTHING",
        )
        .bind(migration.version)
        .bind(migration.description)
        .execute(tx.conn())
        .await
        .map_err(|e| db_error(&format!("record migration {}", migration.version), e))?;

        db.metrics()
            .record_migration(migration.version, started.elapsed().as_secs_f64());
        applied_now += 1;
    }

    db.metrics()
        .update_migration_metrics(db.admin_schema(), applied_versions.len() + applied_now);

    if applied_now > 0 {
        info!(
            "Applied {} migration(s) to schema {}",
            applied_now,
            db.admin_schema()
        );
    }
    Ok(applied_now)
}
