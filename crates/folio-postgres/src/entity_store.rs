//! PostgresEntityStore - EntityStore implementation for one schema family
//!
//! Entities live in a per-family table inside each tenant schema. The table
//! is created lazily, in the tenant's own scope, the first time a tenant
//! touches the family. Writes serialize per entity id on an advisory lock;
//! updates additionally lock the current row.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::Executor;
use sqlx::postgres::PgRow;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{column, db_error, insert_error, version_column};
use crate::space_db::{EnsuredTables, ScopedTx, SpaceDb};
use folio_core::{
    EntityQuery, EntityRecord, EntityStore, EntityWrite, Error, Result, SchemaRecord,
    SchemaStore, SchemaValidator, TenantSpace, Version,
    hash::content_hash,
    ident::{self, quote_ident},
};

const STORE: &str = "entity";

const ENTITY_COLUMNS: &str = "entity_id, entity_version, schema_id, schema_version, payload, \
     hash, created_at, created_by, is_active, is_deleted";

const VERSION_ORDER: &str = "string_to_array(entity_version, '.')::int[]";

/// PostgreSQL-backed entity repository bound to one schema family
pub struct PostgresEntityStore {
    db: SpaceDb,
    schemas: Arc<dyn SchemaStore>,
    validator: Arc<SchemaValidator>,
    schema_id: Uuid,
    /// Validated family table name
    table_name: String,
    /// `table_name` quoted for SQL text
    table: String,
    ensured: EnsuredTables,
}

impl PostgresEntityStore {
    /// Bind a repository to `schema_id`, resolving the family's table name
    /// from its active version.
    ///
    /// # Errors
    /// - `Error::NotFound` / `Error::Deleted` if the family has no active version
    /// - `Error::Validation` if the recorded table name is not a valid identifier
    pub async fn new(
        db: SpaceDb,
        schemas: Arc<dyn SchemaStore>,
        validator: Arc<SchemaValidator>,
        schema_id: Uuid,
    ) -> Result<Self> {
        let active = schemas.get_active_schema(schema_id).await?;
        let table_name = ident::normalize_table_name(&active.table_name)?;
        let table = quote_ident(&table_name);

        debug!(
            "Entity repository for schema {} bound to table {}",
            schema_id, table_name
        );
        Ok(Self {
            db,
            schemas,
            validator,
            schema_id,
            table_name,
            table,
            ensured: EnsuredTables::default(),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Schema version a write validates against: the pinned one, or the
    /// family's active version.
    async fn resolve_schema(&self, pinned: Option<Version>) -> Result<SchemaRecord> {
        match pinned {
            Some(version) => self.schemas.get_schema_by_version(self.schema_id, version).await,
            None => self.schemas.get_active_schema(self.schema_id).await,
        }
    }

    /// Validate and hash a payload outside of any transaction.
    async fn prepare(&self, write: &EntityWrite) -> Result<(SchemaRecord, String)> {
        if write.payload.is_null() {
            return Err(Error::Validation("Entity payload must not be null".to_string()));
        }
        let schema = self.resolve_schema(write.schema_version).await?;
        self.validator.validate(&schema, &write.payload)?;
        Ok((schema, content_hash(&write.payload)))
    }

    async fn begin(&self, space: &TenantSpace) -> Result<ScopedTx> {
        let mut tx = self.db.begin_tenant(space).await?;
        // Dropping the scope on error rolls it back
        self.ensure_table(&mut tx, space).await?;
        Ok(tx)
    }

    /// Commit or roll back, remembering the tenant's table once it is durable.
    async fn complete<T>(&self, space: &TenantSpace, tx: ScopedTx, result: Result<T>) -> Result<T> {
        let result = tx.finish(result).await;
        if result.is_ok() {
            self.ensured.mark(&space.schema_name);
        }
        result
    }

    async fn ensure_table(&self, tx: &mut ScopedTx, space: &TenantSpace) -> Result<()> {
        if self.ensured.contains(&space.schema_name) {
            return Ok(());
        }

        tx.lock_key(&format!(
            "folio:table:{}.{}",
            space.schema_name, self.table_name
        ))
        .await?;
        let ddl = table_ddl(&space.schema_name, &self.table_name, self.db.admin_schema());
        // Called through the trait so the future stays Send inside async_trait
        Executor::execute(tx.conn(), sqlx::raw_sql(&ddl))
            .await
            .map_err(|e| db_error(&format!("ensure table {}", self.table_name), e))?;

        debug!(
            "Ensured table {}.{}",
            space.schema_name, self.table_name
        );
        Ok(())
    }

    async fn lock_entity(&self, tx: &mut ScopedTx, space: &TenantSpace, entity_id: &str) -> Result<()> {
        tx.lock_key(&format!(
            "folio:entity:{}.{}:{}",
            space.schema_name, self.table_name, entity_id
        ))
        .await
    }

    async fn insert_row(
        &self,
        tx: &mut ScopedTx,
        entity_id: &str,
        version: Version,
        schema: &SchemaRecord,
        write: &EntityWrite,
        hash: &str,
    ) -> Result<EntityRecord> {
        let row = sqlx::query(&format!(
            "INSERT INTO {}
                (entity_id, entity_version, schema_id, schema_version, payload, hash,
                 created_by, is_active, is_deleted)
             VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, FALSE)
             RETURNING {}",
            self.table, ENTITY_COLUMNS
        ))
        .bind(entity_id)
        .bind(version.to_string())
        .bind(schema.schema_id)
        .bind(schema.schema_version.to_string())
        .bind(&write.payload)
        .bind(hash)
        .bind(&write.created_by)
        .fetch_one(tx.conn())
        .await
        .map_err(|e| {
            insert_error(
                "insert entity",
                &format!("Entity {} in {}", entity_id, self.table_name),
                e,
            )
        })?;

        row_to_entity(&row)
    }

    async fn create_in(
        &self,
        tx: &mut ScopedTx,
        space: &TenantSpace,
        entity_id: &str,
        schema: &SchemaRecord,
        write: &EntityWrite,
        hash: &str,
    ) -> Result<EntityRecord> {
        self.lock_entity(tx, space, entity_id).await?;

        let exists: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE entity_id = $1)",
            self.table
        ))
        .bind(entity_id)
        .fetch_one(tx.conn())
        .await
        .map_err(|e| db_error("check entity", e))?;

        if exists {
            return Err(Error::AlreadyExists(format!(
                "Entity {} in {}",
                entity_id, self.table_name
            )));
        }

        let record = self
            .insert_row(tx, entity_id, Version::initial(), schema, write, hash)
            .await?;
        debug!(
            "Created entity {}@{} in {}.{}",
            entity_id, record.entity_version, space.schema_name, self.table_name
        );
        Ok(record)
    }

    async fn update_in(
        &self,
        tx: &mut ScopedTx,
        space: &TenantSpace,
        entity_id: &str,
        schema: &SchemaRecord,
        write: &EntityWrite,
        hash: &str,
    ) -> Result<EntityRecord> {
        self.lock_entity(tx, space, entity_id).await?;

        let current = sqlx::query(&format!(
            "SELECT entity_version FROM {}
             WHERE entity_id = $1 AND is_active AND NOT is_deleted
             FOR UPDATE",
            self.table
        ))
        .bind(entity_id)
        .fetch_optional(tx.conn())
        .await
        .map_err(|e| db_error("lock entity", e))?
        .ok_or_else(|| Error::NotFound(format!("Entity {} in {}", entity_id, self.table_name)))?;

        let current_version = version_column(&current, "entity_version")?;
        let next = current_version.next_patch()?;

        sqlx::query(&format!(
            "UPDATE {} SET is_active = FALSE WHERE entity_id = $1 AND entity_version = $2",
            self.table
        ))
        .bind(entity_id)
        .bind(current_version.to_string())
        .execute(tx.conn())
        .await
        .map_err(|e| db_error("supersede entity version", e))?;

        let record = self
            .insert_row(tx, entity_id, next, schema, write, hash)
            .await?;
        debug!(
            "Appended entity {}@{} in {}.{}",
            entity_id, next, space.schema_name, self.table_name
        );
        Ok(record)
    }

    async fn fetch_active(&self, tx: &mut ScopedTx, entity_id: &str) -> Result<EntityRecord> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE entity_id = $1 AND is_active AND NOT is_deleted",
            ENTITY_COLUMNS, self.table
        ))
        .bind(entity_id)
        .fetch_optional(tx.conn())
        .await
        .map_err(|e| db_error("load entity", e))?;

        if let Some(row) = row {
            return row_to_entity(&row);
        }

        let deleted: bool = sqlx::query_scalar(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE entity_id = $1 AND is_deleted)",
            self.table
        ))
        .bind(entity_id)
        .fetch_one(tx.conn())
        .await
        .map_err(|e| db_error("check entity", e))?;

        let what = format!("Entity {} in {}", entity_id, self.table_name);
        Err(if deleted {
            Error::Deleted(what)
        } else {
            Error::NotFound(what)
        })
    }
}

/// DDL for one family table inside one tenant schema
fn table_ddl(tenant_schema: &str, table_name: &str, admin_schema: &str) -> String {
    let qualified = format!("{}.{}", quote_ident(tenant_schema), quote_ident(table_name));
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {qualified} (
            entity_id TEXT NOT NULL,
            entity_version TEXT NOT NULL,
            schema_id UUID NOT NULL,
            schema_version TEXT NOT NULL,
            payload JSONB NOT NULL,
            hash TEXT NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            created_by TEXT NOT NULL,

            PRIMARY KEY (entity_id, entity_version),
            FOREIGN KEY (schema_id, schema_version)
                REFERENCES {admin}.schema_repository (schema_id, schema_version)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS {active_idx}
        ON {qualified} (entity_id) WHERE is_active AND NOT is_deleted;

        CREATE INDEX IF NOT EXISTS {schema_idx}
        ON {qualified} (schema_id, schema_version)
        "#,
        qualified = qualified,
        admin = quote_ident(admin_schema),
        active_idx = quote_ident(&format!("{}_active_uq", table_name)),
        schema_idx = quote_ident(&format!("{}_schema_idx", table_name)),
    )
}

/// SELECT for `list_entities`; `$1` is the limit and `$2` the offset.
fn list_sql(table: &str, query: &EntityQuery) -> String {
    let filter = query
        .filter_sql()
        .map(|f| format!(" WHERE {}", f))
        .unwrap_or_default();
    format!(
        "SELECT {cols} FROM {table}{filter}
         ORDER BY {field} {order}, entity_id ASC, {version} ASC
         LIMIT $1 OFFSET $2",
        cols = ENTITY_COLUMNS,
        table = table,
        filter = filter,
        field = query.sort_field.as_sql(),
        order = query.sort_order.as_sql(),
        version = VERSION_ORDER,
    )
}

fn count_sql(table: &str, query: &EntityQuery) -> String {
    match query.filter_sql() {
        Some(filter) => format!("SELECT COUNT(*) FROM {} WHERE {}", table, filter),
        None => format!("SELECT COUNT(*) FROM {}", table),
    }
}

fn required_entity_id(write: &EntityWrite) -> Result<String> {
    match write.entity_id.as_deref().map(str::trim) {
        None | Some("") => Err(Error::Validation(
            "entity_id is required to update an entity".to_string(),
        )),
        Some(id) => {
            ident::validate_entity_id(id)?;
            Ok(id.to_string())
        }
    }
}

fn row_to_entity(row: &PgRow) -> Result<EntityRecord> {
    let payload: Value = column(row, "payload")?;
    Ok(EntityRecord {
        entity_id: column(row, "entity_id")?,
        entity_version: version_column(row, "entity_version")?,
        schema_id: column(row, "schema_id")?,
        schema_version: version_column(row, "schema_version")?,
        payload,
        hash: column(row, "hash")?,
        created_at: column(row, "created_at")?,
        created_by: column(row, "created_by")?,
        is_active: column(row, "is_active")?,
        is_deleted: column(row, "is_deleted")?,
    })
}

#[async_trait]
impl EntityStore for PostgresEntityStore {
    fn schema_id(&self) -> Uuid {
        self.schema_id
    }

    async fn create_entity(&self, space: &TenantSpace, write: EntityWrite) -> Result<EntityRecord> {
        self.db
            .observed(STORE, "create", async {
                let entity_id = ident::normalize_entity_id(write.entity_id.as_deref())?;
                let (schema, hash) = self.prepare(&write).await?;

                let mut tx = self.begin(space).await?;
                let result = self
                    .create_in(&mut tx, space, &entity_id, &schema, &write, &hash)
                    .await;
                self.complete(space, tx, result).await
            })
            .await
    }

    async fn update_entity(&self, space: &TenantSpace, write: EntityWrite) -> Result<EntityRecord> {
        self.db
            .observed(STORE, "update", async {
                let entity_id = required_entity_id(&write)?;
                let (schema, hash) = self.prepare(&write).await?;

                let mut tx = self.begin(space).await?;
                let result = self
                    .update_in(&mut tx, space, &entity_id, &schema, &write, &hash)
                    .await;
                self.complete(space, tx, result).await
            })
            .await
    }

    async fn get_entity_by_id(&self, space: &TenantSpace, entity_id: &str) -> Result<EntityRecord> {
        self.db
            .observed(STORE, "get", async {
                ident::validate_entity_id(entity_id)?;
                let mut tx = self.begin(space).await?;
                let result = self.fetch_active(&mut tx, entity_id).await;
                self.complete(space, tx, result).await
            })
            .await
    }

    async fn get_entity_version(
        &self,
        space: &TenantSpace,
        entity_id: &str,
        version: Version,
    ) -> Result<EntityRecord> {
        self.db
            .observed(STORE, "get_version", async {
                ident::validate_entity_id(entity_id)?;
                let mut tx = self.begin(space).await?;
                let result: Result<EntityRecord> = async {
                    let row = sqlx::query(&format!(
                        "SELECT {} FROM {} WHERE entity_id = $1 AND entity_version = $2",
                        ENTITY_COLUMNS, self.table
                    ))
                    .bind(entity_id)
                    .bind(version.to_string())
                    .fetch_optional(tx.conn())
                    .await
                    .map_err(|e| db_error("load entity version", e))?
                    .ok_or_else(|| {
                        Error::NotFound(format!(
                            "Entity {}@{} in {}",
                            entity_id, version, self.table_name
                        ))
                    })?;
                    row_to_entity(&row)
                }
                .await;
                self.complete(space, tx, result).await
            })
            .await
    }

    async fn list_entity_versions(
        &self,
        space: &TenantSpace,
        entity_id: &str,
    ) -> Result<Vec<EntityRecord>> {
        self.db
            .observed(STORE, "list_versions", async {
                ident::validate_entity_id(entity_id)?;
                let mut tx = self.begin(space).await?;
                let result: Result<Vec<EntityRecord>> = async {
                    let rows = sqlx::query(&format!(
                        "SELECT {} FROM {} WHERE entity_id = $1 ORDER BY {} ASC",
                        ENTITY_COLUMNS, self.table, VERSION_ORDER
                    ))
                    .bind(entity_id)
                    .fetch_all(tx.conn())
                    .await
                    .map_err(|e| db_error("list entity versions", e))?;

                    if rows.is_empty() {
                        return Err(Error::NotFound(format!(
                            "Entity {} in {}",
                            entity_id, self.table_name
                        )));
                    }
                    rows.iter().map(row_to_entity).collect::<Result<Vec<_>>>()
                }
                .await;
                self.complete(space, tx, result).await
            })
            .await
    }

    async fn list_entities(
        &self,
        space: &TenantSpace,
        query: &EntityQuery,
    ) -> Result<Vec<EntityRecord>> {
        self.db
            .observed(STORE, "list", async {
                let mut tx = self.begin(space).await?;
                let result: Result<Vec<EntityRecord>> = async {
                    let rows = sqlx::query(&list_sql(&self.table, query))
                        .bind(i64::from(query.effective_limit()))
                        .bind(i64::from(query.offset))
                        .fetch_all(tx.conn())
                        .await
                        .map_err(|e| db_error("list entities", e))?;

                    rows.iter().map(row_to_entity).collect::<Result<Vec<_>>>()
                }
                .await;
                self.complete(space, tx, result).await
            })
            .await
    }

    async fn count_entities(&self, space: &TenantSpace, query: &EntityQuery) -> Result<u64> {
        self.db
            .observed(STORE, "count", async {
                let mut tx = self.begin(space).await?;
                let result: Result<u64> = async {
                    let count: i64 = sqlx::query_scalar(&count_sql(&self.table, query))
                        .fetch_one(tx.conn())
                        .await
                        .map_err(|e| db_error("count entities", e))?;
                    Ok(count.max(0) as u64)
                }
                .await;
                self.complete(space, tx, result).await
            })
            .await
    }

    async fn soft_delete_entity(&self, space: &TenantSpace, entity_id: &str) -> Result<()> {
        self.db
            .observed(STORE, "delete", async {
                ident::validate_entity_id(entity_id)?;
                let mut tx = self.begin(space).await?;
                let result: Result<()> = async {
                    self.lock_entity(&mut tx, space, entity_id).await?;
                    let deleted = sqlx::query(&format!(
                        "UPDATE {} SET is_deleted = TRUE, is_active = FALSE
                         WHERE entity_id = $1 AND is_active AND NOT is_deleted",
                        self.table
                    ))
                    .bind(entity_id)
                    .execute(tx.conn())
                    .await
                    .map_err(|e| db_error("delete entity", e))?;

                    if deleted.rows_affected() == 0 {
                        return Err(Error::NotFound(format!(
                            "Entity {} in {}",
                            entity_id, self.table_name
                        )));
                    }
                    info!(
                        "Deleted entity {} in {}.{}",
                        entity_id, space.schema_name, self.table_name
                    );
                    Ok(())
                }
                .await;
                self.complete(space, tx, result).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{SortField, SortOrder};

    #[test]
    fn test_table_ddl_is_qualified() {
        let ddl = table_ddl("tenant_1a2b3c4d", "cards", "folio_admin");
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS \"tenant_1a2b3c4d\".\"cards\""));
        assert!(ddl.contains("REFERENCES \"folio_admin\".schema_repository"));
        assert!(ddl.contains("\"cards_active_uq\""));
        assert!(ddl.contains("WHERE is_active AND NOT is_deleted"));
        assert!(ddl.contains("\"cards_schema_idx\""));
    }

    #[test]
    fn test_list_sql_default_query() {
        let sql = list_sql("\"cards\"", &EntityQuery::default());
        assert!(sql.contains("FROM \"cards\" WHERE is_active AND NOT is_deleted"));
        assert!(sql.contains("ORDER BY created_at DESC"));
        assert!(sql.contains("LIMIT $1 OFFSET $2"));
    }

    #[test]
    fn test_list_sql_all_versions_by_version() {
        let query = EntityQuery::all_versions().with_sort(SortField::EntityVersion, SortOrder::Asc);
        let sql = list_sql("\"cards\"", &query);
        assert!(!sql.contains("WHERE"));
        assert!(sql.contains("ORDER BY string_to_array(entity_version, '.')::int[] ASC"));
    }

    #[test]
    fn test_count_sql() {
        assert_eq!(
            count_sql("\"cards\"", &EntityQuery::default().with_deleted()),
            "SELECT COUNT(*) FROM \"cards\" WHERE (is_active OR is_deleted)"
        );
        assert_eq!(
            count_sql("\"cards\"", &EntityQuery::all_versions()),
            "SELECT COUNT(*) FROM \"cards\""
        );
    }

    #[test]
    fn test_update_requires_entity_id() {
        let write = EntityWrite::new(serde_json::json!({"name": "Ancestral Recall"}), "alice");
        assert!(matches!(
            required_entity_id(&write),
            Err(Error::Validation(_))
        ));

        let write = write.with_entity_id(" recall ");
        assert_eq!(required_entity_id(&write).unwrap(), "recall");

        let write = EntityWrite::new(serde_json::json!({}), "alice").with_entity_id("bad id");
        assert!(required_entity_id(&write).is_err());
    }
}
