//! PostgresTenantStore - TenantStore implementation over the admin schema
//!
//! The registry is append-only. The current state of a tenant is its highest
//! version; every change inserts `patch + 1` and flips the previous version
//! inactive while holding the tenant's advisory lock.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{column, db_error, insert_error, version_column};
use crate::space_db::{ScopedTx, SpaceDb};
use folio_core::{
    Error, NewTenant, Result, TenantChange, TenantId, TenantRecord, TenantSpace, TenantStatus,
    TenantStore, Version,
    ident::{self, quote_ident},
};

const STORE: &str = "tenant";

/// Lock taken while a new tenant claims its slug and schema name
const TENANT_NAMES_LOCK: &str = "folio:tenant-names";

const TENANT_COLUMNS: &str = "tenant_id, tenant_version, slug, schema_name, role_name, \
     base_prefix, status, db_ready, auth_ready, last_provisioned_at, last_error, is_active, \
     is_deleted, created_at, created_by";

const VERSION_ORDER: &str = "string_to_array(tenant_version, '.')::int[]";

#[derive(Clone)]
pub struct PostgresTenantStore {
    db: SpaceDb,
}

impl PostgresTenantStore {
    pub fn new(db: SpaceDb) -> Self {
        Self { db }
    }

    async fn create_in(&self, tx: &mut ScopedTx, tenant: NewTenant) -> Result<TenantRecord> {
        let tenant_id = tenant.tenant_id.unwrap_or_default();
        let space = TenantSpace::derive(tenant_id, &tenant.slug)?;
        space.validate()?;

        tx.lock_key(TENANT_NAMES_LOCK).await?;
        let taken: Option<Uuid> = sqlx::query_scalar(
            "SELECT tenant_id FROM tenants
             WHERE tenant_id = $1 OR slug = $2 OR schema_name = $3
             LIMIT 1",
        )
        .bind(tenant_id.as_uuid())
        .bind(&space.slug)
        .bind(&space.schema_name)
        .fetch_optional(tx.conn())
        .await
        .map_err(|e| db_error("check tenant names", e))?;

        if let Some(owner) = taken {
            return Err(Error::AlreadyExists(format!(
                "Tenant id {}, slug '{}' or schema {} is already registered (tenant {})",
                tenant_id, space.slug, space.schema_name, owner
            )));
        }

        let now = Utc::now();
        let record = insert_version(
            tx,
            &TenantRecord {
                tenant_id,
                tenant_version: Version::initial(),
                slug: space.slug.clone(),
                schema_name: space.schema_name.clone(),
                role_name: space.role_name.clone(),
                base_prefix: space.base_prefix.clone(),
                status: TenantStatus::Pending,
                db_ready: false,
                auth_ready: false,
                last_provisioned_at: None,
                last_error: None,
                is_active: true,
                is_deleted: false,
                created_at: now,
                created_by: tenant.created_by,
            },
        )
        .await?;

        info!(
            "Registered tenant {} ({}) with schema {}",
            record.slug, record.tenant_id, record.schema_name
        );
        Ok(record)
    }

    /// Create the schema and role and grant the role what a tenant scope needs.
    async fn provision_in(&self, tx: &mut ScopedTx, space: &TenantSpace) -> Result<()> {
        space.validate()?;
        let schema = quote_ident(&space.schema_name);
        let role = quote_ident(&space.role_name);
        let admin = quote_ident(self.db.admin_schema());

        let role_exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_roles WHERE rolname = $1)")
                .bind(&space.role_name)
                .fetch_one(tx.conn())
                .await
                .map_err(|e| db_error("check tenant role", e))?;
        if !role_exists {
            execute(tx, "create tenant role", &format!("CREATE ROLE {} NOLOGIN", role)).await?;
        }

        // The connecting role must be able to switch into the tenant role
        execute(
            tx,
            "grant tenant role",
            &format!("GRANT {} TO CURRENT_USER", role),
        )
        .await?;
        execute(
            tx,
            "create tenant schema",
            &format!("CREATE SCHEMA IF NOT EXISTS {}", schema),
        )
        .await?;
        execute(
            tx,
            "grant tenant schema",
            &format!("GRANT USAGE, CREATE ON SCHEMA {} TO {}", schema, role),
        )
        .await?;
        execute(
            tx,
            "grant admin schema",
            &format!("GRANT USAGE ON SCHEMA {} TO {}", admin, role),
        )
        .await?;
        execute(
            tx,
            "grant admin tables",
            &format!(
                "GRANT SELECT, REFERENCES ON {admin}.schema_repository, {admin}.categories TO {role}",
                admin = admin,
                role = role
            ),
        )
        .await?;

        debug!(
            "Provisioned schema {} and role {}",
            space.schema_name, space.role_name
        );
        Ok(())
    }

    async fn provision_attempt(&self, tenant_id: TenantId, created_by: &str) -> Result<TenantRecord> {
        let mut tx = self.db.begin_admin().await?;
        let result: Result<TenantRecord> = async {
            lock_tenant(&mut tx, tenant_id).await?;
            let current = current_version(&mut tx, tenant_id).await?;
            self.provision_in(&mut tx, &current.space()).await?;
            append(
                &mut tx,
                &current,
                TenantChange {
                    status: Some(TenantStatus::Active),
                    db_ready: Some(true),
                    provisioned: true,
                    ..TenantChange::default()
                },
                created_by,
            )
            .await
        }
        .await;
        tx.finish(result).await
    }

    /// Record a failed provisioning attempt in its own transaction.
    async fn record_failure(
        &self,
        tenant_id: TenantId,
        error: &Error,
        created_by: &str,
    ) -> Result<TenantRecord> {
        let mut tx = self.db.begin_admin().await?;
        let result: Result<TenantRecord> = async {
            lock_tenant(&mut tx, tenant_id).await?;
            let current = current_version(&mut tx, tenant_id).await?;
            append(
                &mut tx,
                &current,
                TenantChange {
                    status: Some(TenantStatus::Failed),
                    db_ready: Some(false),
                    last_error: Some(error.to_string()),
                    ..TenantChange::default()
                },
                created_by,
            )
            .await
        }
        .await;
        tx.finish(result).await
    }
}

fn lock_key(tenant_id: TenantId) -> String {
    format!("folio:tenant:{}", tenant_id)
}

async fn lock_tenant(tx: &mut ScopedTx, tenant_id: TenantId) -> Result<()> {
    tx.lock_key(&lock_key(tenant_id)).await
}

async fn execute(tx: &mut ScopedTx, operation: &str, sql: &str) -> Result<()> {
    sqlx::query(sql)
        .execute(tx.conn())
        .await
        .map_err(|e| db_error(operation, e))?;
    Ok(())
}

async fn latest_version(tx: &mut ScopedTx, tenant_id: TenantId) -> Result<Option<TenantRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM tenants WHERE tenant_id = $1 ORDER BY {} DESC LIMIT 1",
        TENANT_COLUMNS, VERSION_ORDER
    ))
    .bind(tenant_id.as_uuid())
    .fetch_optional(tx.conn())
    .await
    .map_err(|e| db_error("load tenant", e))?;

    row.as_ref().map(row_to_tenant).transpose()
}

/// Latest version of a live tenant
async fn current_version(tx: &mut ScopedTx, tenant_id: TenantId) -> Result<TenantRecord> {
    match latest_version(tx, tenant_id).await? {
        None => Err(Error::NotFound(format!("Tenant {}", tenant_id))),
        Some(record) if record.is_deleted => Err(Error::Deleted(format!("Tenant {}", tenant_id))),
        Some(record) => Ok(record),
    }
}

/// Field values of the version following `current`
fn next_version(current: &TenantRecord, change: TenantChange, created_by: &str) -> Result<TenantRecord> {
    let status = change.status.unwrap_or(current.status);
    if status == TenantStatus::Deleted {
        return Err(Error::Validation(
            "Tenants are deleted with delete_tenant, not by status change".to_string(),
        ));
    }

    let now = Utc::now();
    Ok(TenantRecord {
        tenant_version: current.tenant_version.next_patch()?,
        status,
        db_ready: change.db_ready.unwrap_or(current.db_ready),
        auth_ready: change.auth_ready.unwrap_or(current.auth_ready),
        last_provisioned_at: if change.provisioned {
            Some(now)
        } else {
            current.last_provisioned_at
        },
        last_error: change.last_error,
        is_active: true,
        is_deleted: false,
        created_at: now,
        created_by: created_by.to_string(),
        ..current.clone()
    })
}

/// Flip `current` inactive and insert the next version. Caller holds the tenant lock.
async fn append(
    tx: &mut ScopedTx,
    current: &TenantRecord,
    change: TenantChange,
    created_by: &str,
) -> Result<TenantRecord> {
    let next = next_version(current, change, created_by)?;
    supersede(tx, current).await?;
    let record = insert_version(tx, &next).await?;
    info!(
        "Tenant {} moved to {} at version {}",
        record.slug, record.status, record.tenant_version
    );
    Ok(record)
}

async fn supersede(tx: &mut ScopedTx, current: &TenantRecord) -> Result<()> {
    sqlx::query(
        "UPDATE tenants SET is_active = FALSE WHERE tenant_id = $1 AND tenant_version = $2",
    )
    .bind(current.tenant_id.as_uuid())
    .bind(current.tenant_version.to_string())
    .execute(tx.conn())
    .await
    .map_err(|e| db_error("supersede tenant version", e))?;
    Ok(())
}

async fn insert_version(tx: &mut ScopedTx, record: &TenantRecord) -> Result<TenantRecord> {
    let row = sqlx::query(&format!(
        "INSERT INTO tenants
            (tenant_id, tenant_version, slug, schema_name, role_name, base_prefix, status,
             db_ready, auth_ready, last_provisioned_at, last_error, is_active, is_deleted,
             created_by)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
         RETURNING {}",
        TENANT_COLUMNS
    ))
    .bind(record.tenant_id.as_uuid())
    .bind(record.tenant_version.to_string())
    .bind(&record.slug)
    .bind(&record.schema_name)
    .bind(&record.role_name)
    .bind(&record.base_prefix)
    .bind(record.status.as_str())
    .bind(record.db_ready)
    .bind(record.auth_ready)
    .bind(record.last_provisioned_at)
    .bind(&record.last_error)
    .bind(record.is_active)
    .bind(record.is_deleted)
    .bind(&record.created_by)
    .fetch_one(tx.conn())
    .await
    .map_err(|e| {
        insert_error(
            "insert tenant version",
            &format!("Tenant {}@{}", record.tenant_id, record.tenant_version),
            e,
        )
    })?;

    row_to_tenant(&row)
}

fn row_to_tenant(row: &PgRow) -> Result<TenantRecord> {
    let status: String = column(row, "status")?;
    Ok(TenantRecord {
        tenant_id: TenantId::from_uuid(column(row, "tenant_id")?),
        tenant_version: version_column(row, "tenant_version")?,
        slug: column(row, "slug")?,
        schema_name: column(row, "schema_name")?,
        role_name: column(row, "role_name")?,
        base_prefix: column(row, "base_prefix")?,
        status: status
            .parse()
            .map_err(|e| Error::Database(format!("Corrupt tenant status: {}", e)))?,
        db_ready: column(row, "db_ready")?,
        auth_ready: column(row, "auth_ready")?,
        last_provisioned_at: column(row, "last_provisioned_at")?,
        last_error: column(row, "last_error")?,
        is_active: column(row, "is_active")?,
        is_deleted: column(row, "is_deleted")?,
        created_at: column(row, "created_at")?,
        created_by: column(row, "created_by")?,
    })
}

/// A tenant can be scoped into once it is active and its database objects exist.
fn ensure_resolvable(record: &TenantRecord) -> Result<TenantSpace> {
    if record.status != TenantStatus::Active {
        return Err(Error::Validation(format!(
            "Tenant {} is {}, not active",
            record.slug, record.status
        )));
    }
    if !record.db_ready {
        return Err(Error::Validation(format!(
            "Tenant {} is not provisioned",
            record.slug
        )));
    }
    let space = record.space();
    space.validate()?;
    Ok(space)
}

#[async_trait]
impl TenantStore for PostgresTenantStore {
    async fn create_tenant(&self, tenant: NewTenant) -> Result<TenantRecord> {
        self.db
            .observed(STORE, "create", async {
                let mut tx = self.db.begin_admin().await?;
                let result = self.create_in(&mut tx, tenant).await;
                tx.finish(result).await
            })
            .await
    }

    async fn get_tenant(&self, tenant_id: TenantId) -> Result<TenantRecord> {
        self.db
            .observed(STORE, "get", async {
                let mut tx = self.db.begin_admin().await?;
                let result = current_version(&mut tx, tenant_id).await;
                tx.finish(result).await
            })
            .await
    }

    async fn get_tenant_by_slug(&self, slug: &str) -> Result<TenantRecord> {
        self.db
            .observed(STORE, "get_by_slug", async {
                let slug = ident::normalize_slug(slug)?;
                let mut tx = self.db.begin_admin().await?;
                let result: Result<TenantRecord> = async {
                    let tenant_id: Option<Uuid> =
                        sqlx::query_scalar("SELECT tenant_id FROM tenants WHERE slug = $1 LIMIT 1")
                            .bind(&slug)
                            .fetch_optional(tx.conn())
                            .await
                            .map_err(|e| db_error("find tenant by slug", e))?;

                    match tenant_id {
                        Some(id) => current_version(&mut tx, TenantId::from_uuid(id)).await,
                        None => Err(Error::NotFound(format!("Tenant with slug {}", slug))),
                    }
                }
                .await;
                tx.finish(result).await
            })
            .await
    }

    async fn list_tenants(&self, include_deleted: bool) -> Result<Vec<TenantRecord>> {
        self.db
            .observed(STORE, "list", async {
                let deleted_filter = if include_deleted {
                    ""
                } else {
                    "WHERE NOT is_deleted"
                };
                let mut tx = self.db.begin_admin().await?;
                let result: Result<Vec<TenantRecord>> = async {
                    let rows = sqlx::query(&format!(
                        "SELECT * FROM (
                            SELECT DISTINCT ON (tenant_id) {cols}
                            FROM tenants
                            ORDER BY tenant_id, {order} DESC
                         ) latest
                         {filter}
                         ORDER BY slug",
                        cols = TENANT_COLUMNS,
                        order = VERSION_ORDER,
                        filter = deleted_filter
                    ))
                    .fetch_all(tx.conn())
                    .await
                    .map_err(|e| db_error("list tenants", e))?;

                    rows.iter().map(row_to_tenant).collect::<Result<Vec<_>>>()
                }
                .await;
                tx.finish(result).await
            })
            .await
    }

    async fn list_tenant_versions(&self, tenant_id: TenantId) -> Result<Vec<TenantRecord>> {
        self.db
            .observed(STORE, "list_versions", async {
                let mut tx = self.db.begin_admin().await?;
                let result: Result<Vec<TenantRecord>> = async {
                    let rows = sqlx::query(&format!(
                        "SELECT {} FROM tenants WHERE tenant_id = $1 ORDER BY {} ASC",
                        TENANT_COLUMNS, VERSION_ORDER
                    ))
                    .bind(tenant_id.as_uuid())
                    .fetch_all(tx.conn())
                    .await
                    .map_err(|e| db_error("list tenant versions", e))?;

                    if rows.is_empty() {
                        return Err(Error::NotFound(format!("Tenant {}", tenant_id)));
                    }
                    rows.iter().map(row_to_tenant).collect::<Result<Vec<_>>>()
                }
                .await;
                tx.finish(result).await
            })
            .await
    }

    async fn append_tenant_version(
        &self,
        tenant_id: TenantId,
        change: TenantChange,
        created_by: &str,
    ) -> Result<TenantRecord> {
        self.db
            .observed(STORE, "append_version", async {
                let mut tx = self.db.begin_admin().await?;
                let result: Result<TenantRecord> = async {
                    lock_tenant(&mut tx, tenant_id).await?;
                    let current = current_version(&mut tx, tenant_id).await?;
                    append(&mut tx, &current, change, created_by).await
                }
                .await;
                tx.finish(result).await
            })
            .await
    }

    async fn provision_tenant(
        &self,
        tenant_id: TenantId,
        created_by: &str,
    ) -> Result<TenantRecord> {
        self.db
            .observed(STORE, "provision", async {
                match self.provision_attempt(tenant_id, created_by).await {
                    Ok(record) => {
                        info!(
                            "Provisioned tenant {} (schema {}, role {})",
                            record.slug, record.schema_name, record.role_name
                        );
                        Ok(record)
                    }
                    // Nothing to record against a tenant that is missing or gone
                    Err(err @ (Error::NotFound(_) | Error::Deleted(_))) => Err(err),
                    Err(err) => {
                        if let Err(record_err) =
                            self.record_failure(tenant_id, &err, created_by).await
                        {
                            warn!(
                                "Failed to record provisioning failure for tenant {}: {}",
                                tenant_id, record_err
                            );
                        }
                        Err(err)
                    }
                }
            })
            .await
    }

    async fn resolve_space(&self, tenant_id: TenantId) -> Result<TenantSpace> {
        let record = self.get_tenant(tenant_id).await?;
        ensure_resolvable(&record)
    }

    async fn delete_tenant(&self, tenant_id: TenantId, deleted_by: &str) -> Result<TenantRecord> {
        self.db
            .observed(STORE, "delete", async {
                let mut tx = self.db.begin_admin().await?;
                let result: Result<TenantRecord> = async {
                    lock_tenant(&mut tx, tenant_id).await?;
                    let current = current_version(&mut tx, tenant_id).await?;
                    let tombstone = TenantRecord {
                        tenant_version: current.tenant_version.next_patch()?,
                        status: TenantStatus::Deleted,
                        is_active: false,
                        is_deleted: true,
                        last_error: None,
                        created_at: Utc::now(),
                        created_by: deleted_by.to_string(),
                        ..current.clone()
                    };
                    supersede(&mut tx, &current).await?;
                    let record = insert_version(&mut tx, &tombstone).await?;
                    info!("Deleted tenant {} ({})", record.slug, record.tenant_id);
                    Ok(record)
                }
                .await;
                tx.finish(result).await
            })
            .await
    }
}
