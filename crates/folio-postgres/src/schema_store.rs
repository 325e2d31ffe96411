//! PostgresSchemaStore - SchemaStore implementation over the admin schema
//!
//! Mutations serialize per family on an advisory lock. A re-submitted version
//! with an identical definition is accepted as a no-op (optionally activating
//! it); a different definition under an existing version is a conflict.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::{column, db_error, insert_error, version_column};
use crate::space_db::{ScopedTx, SpaceDb};
use folio_core::{
    Error, Result, SchemaListQuery, SchemaRecord, SchemaStore, SchemaValidator, SchemaWrite,
    Version, hash::content_hash, ident,
};

const STORE: &str = "schema";

/// Lock taken while a new family claims its table name and slug
const FAMILY_NAMES_LOCK: &str = "folio:schema-family-names";

const SCHEMA_COLUMNS: &str = "schema_id, schema_version, schema_definition, hash, table_name, \
     slug, category_id, created_at, created_by, is_active, is_deleted";

const VERSION_ORDER: &str = "string_to_array(schema_version, '.')::int[]";

/// How a family is looked up
#[derive(Debug, Clone, Copy)]
enum FamilyKey<'a> {
    Id(Uuid),
    Table(&'a str),
    Slug(&'a str),
}

impl FamilyKey<'_> {
    fn filter(&self) -> &'static str {
        match self {
            FamilyKey::Id(_) => "schema_id = $1",
            FamilyKey::Table(_) => "table_name = $1",
            FamilyKey::Slug(_) => "slug = $1",
        }
    }

    fn describe(&self) -> String {
        match self {
            FamilyKey::Id(id) => format!("Schema {}", id),
            FamilyKey::Table(table) => format!("Schema for table {}", table),
            FamilyKey::Slug(slug) => format!("Schema with slug {}", slug),
        }
    }

    fn bind<'q>(
        &self,
        query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        match *self {
            FamilyKey::Id(id) => query.bind(id),
            FamilyKey::Table(table) => query.bind(table.to_string()),
            FamilyKey::Slug(slug) => query.bind(slug.to_string()),
        }
    }
}

/// Recorded identity of a family
struct FamilyNames {
    table_name: String,
    slug: String,
}

/// PostgreSQL-backed schema repository
#[derive(Clone)]
pub struct PostgresSchemaStore {
    db: SpaceDb,
}

impl PostgresSchemaStore {
    pub fn new(db: SpaceDb) -> Self {
        Self { db }
    }

    async fn write_version(&self, tx: &mut ScopedTx, write: SchemaWrite) -> Result<SchemaRecord> {
        check_definition(&write.definition)?;
        tx.lock_key(&family_lock_key(write.schema_id)).await?;

        let names = match family_names(tx, write.schema_id).await? {
            Some(recorded) => {
                ensure_matches(
                    "table_name",
                    &recorded.table_name,
                    write.table_name.as_deref(),
                    ident::normalize_table_name,
                )?;
                ensure_matches(
                    "slug",
                    &recorded.slug,
                    write.slug.as_deref(),
                    ident::normalize_slug,
                )?;
                recorded
            }
            None => claim_family_names(tx, &write).await?,
        };

        ensure_category(tx, write.category_id).await?;

        let hash = content_hash(&write.definition);
        if let Some(existing) =
            fetch_version(tx, write.schema_id, write.schema_version).await?
        {
            if existing.is_deleted {
                return Err(Error::Deleted(format!(
                    "Schema {}@{}",
                    write.schema_id, write.schema_version
                )));
            }
            if existing.hash != hash {
                return Err(Error::Conflict(format!(
                    "Schema {}@{} already exists with a different definition",
                    write.schema_id, write.schema_version
                )));
            }
            debug!(
                "Schema {}@{} re-submitted unchanged",
                write.schema_id, write.schema_version
            );
            if write.activate && !existing.is_active {
                return activate(tx, write.schema_id, write.schema_version).await;
            }
            return Ok(existing);
        }

        if write.activate {
            deactivate_family(tx, write.schema_id).await?;
        }

        let row = sqlx::query(&format!(
            "INSERT INTO schema_repository
                (schema_id, schema_version, schema_definition, hash, table_name, slug,
                 category_id, created_by, is_active, is_deleted)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE)
             RETURNING {}",
            SCHEMA_COLUMNS
        ))
        .bind(write.schema_id)
        .bind(write.schema_version.to_string())
        .bind(&write.definition)
        .bind(&hash)
        .bind(&names.table_name)
        .bind(&names.slug)
        .bind(write.category_id)
        .bind(&write.created_by)
        .bind(write.activate)
        .fetch_one(tx.conn())
        .await
        .map_err(|e| {
            insert_error(
                "insert schema version",
                &format!("Schema {}@{}", write.schema_id, write.schema_version),
                e,
            )
        })?;

        info!(
            "Stored schema {}@{} (table {}, active: {})",
            write.schema_id, write.schema_version, names.table_name, write.activate
        );
        row_to_schema(&row)
    }
}

fn family_lock_key(schema_id: Uuid) -> String {
    format!("folio:schema:{}", schema_id)
}

fn check_definition(definition: &Value) -> Result<()> {
    match definition.as_object() {
        Some(map) if !map.is_empty() => SchemaValidator::check_definition(definition),
        _ => Err(Error::Validation(
            "Schema definition must be a non-empty JSON object".to_string(),
        )),
    }
}

/// A supplied family name must normalize to the recorded one.
fn ensure_matches(
    field: &str,
    recorded: &str,
    supplied: Option<&str>,
    normalize: impl Fn(&str) -> Result<String>,
) -> Result<()> {
    let Some(supplied) = supplied else {
        return Ok(());
    };
    let normalized = normalize(supplied)?;
    if normalized != recorded {
        return Err(Error::Conflict(format!(
            "{} '{}' does not match the family's recorded value '{}'",
            field, normalized, recorded
        )));
    }
    Ok(())
}

async fn family_names(tx: &mut ScopedTx, schema_id: Uuid) -> Result<Option<FamilyNames>> {
    let row = sqlx::query(
        "SELECT table_name, slug FROM schema_repository WHERE schema_id = $1 LIMIT 1",
    )
    .bind(schema_id)
    .fetch_optional(tx.conn())
    .await
    .map_err(|e| db_error("load schema family", e))?;

    row.map(|row| -> Result<FamilyNames> {
        Ok(FamilyNames {
            table_name: column(&row, "table_name")?,
            slug: column(&row, "slug")?,
        })
    })
    .transpose()
}

/// First version of a family: both names are required and must be free.
async fn claim_family_names(tx: &mut ScopedTx, write: &SchemaWrite) -> Result<FamilyNames> {
    let table_name = write.table_name.as_deref().ok_or_else(|| {
        Error::Validation("table_name is required for the first version of a schema".to_string())
    })?;
    let slug = write.slug.as_deref().ok_or_else(|| {
        Error::Validation("slug is required for the first version of a schema".to_string())
    })?;
    let names = FamilyNames {
        table_name: ident::normalize_table_name(table_name)?,
        slug: ident::normalize_slug(slug)?,
    };

    tx.lock_key(FAMILY_NAMES_LOCK).await?;
    let taken: Option<Uuid> = sqlx::query_scalar(
        "SELECT schema_id FROM schema_repository
         WHERE (table_name = $1 OR slug = $2) AND schema_id <> $3
         LIMIT 1",
    )
    .bind(&names.table_name)
    .bind(&names.slug)
    .bind(write.schema_id)
    .fetch_optional(tx.conn())
    .await
    .map_err(|e| db_error("check schema family names", e))?;

    if let Some(other) = taken {
        return Err(Error::Conflict(format!(
            "table_name '{}' or slug '{}' is already used by schema {}",
            names.table_name, names.slug, other
        )));
    }
    Ok(names)
}

async fn ensure_category(tx: &mut ScopedTx, category_id: Uuid) -> Result<()> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM categories WHERE category_id = $1)")
            .bind(category_id)
            .fetch_one(tx.conn())
            .await
            .map_err(|e| db_error("check category", e))?;
    if exists {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Category {} does not exist",
            category_id
        )))
    }
}

async fn fetch_version(
    tx: &mut ScopedTx,
    schema_id: Uuid,
    version: Version,
) -> Result<Option<SchemaRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM schema_repository WHERE schema_id = $1 AND schema_version = $2",
        SCHEMA_COLUMNS
    ))
    .bind(schema_id)
    .bind(version.to_string())
    .fetch_optional(tx.conn())
    .await
    .map_err(|e| db_error("load schema version", e))?;

    row.as_ref().map(row_to_schema).transpose()
}

async fn deactivate_family(tx: &mut ScopedTx, schema_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE schema_repository SET is_active = FALSE WHERE schema_id = $1 AND is_active",
    )
    .bind(schema_id)
    .execute(tx.conn())
    .await
    .map_err(|e| db_error("deactivate schema versions", e))?;
    Ok(())
}

/// Make one version the family's only active version. Caller holds the family lock.
async fn activate(tx: &mut ScopedTx, schema_id: Uuid, version: Version) -> Result<SchemaRecord> {
    match fetch_version(tx, schema_id, version).await? {
        None => {
            return Err(Error::NotFound(format!("Schema {}@{}", schema_id, version)));
        }
        Some(target) if target.is_deleted => {
            return Err(Error::Deleted(format!("Schema {}@{}", schema_id, version)));
        }
        Some(target) if target.is_active => return Ok(target),
        Some(_) => {}
    }

    deactivate_family(tx, schema_id).await?;
    let row = sqlx::query(&format!(
        "UPDATE schema_repository SET is_active = TRUE
         WHERE schema_id = $1 AND schema_version = $2
         RETURNING {}",
        SCHEMA_COLUMNS
    ))
    .bind(schema_id)
    .bind(version.to_string())
    .fetch_one(tx.conn())
    .await
    .map_err(|e| db_error("activate schema version", e))?;

    info!("Activated schema {}@{}", schema_id, version);
    row_to_schema(&row)
}

/// Error for a lookup that found no usable row: `Deleted` when every version
/// of the family is deleted, `NotFound` otherwise.
async fn absence(tx: &mut ScopedTx, key: FamilyKey<'_>) -> Result<Error> {
    let all_deleted: Option<bool> = key
        .bind(sqlx::query(&format!(
            "SELECT bool_and(is_deleted) AS all_deleted FROM schema_repository WHERE {}",
            key.filter()
        )))
        .fetch_one(tx.conn())
        .await
        .map_err(|e| db_error("check schema family", e))
        .and_then(|row| column(&row, "all_deleted"))?;

    Ok(match all_deleted {
        None => Error::NotFound(key.describe()),
        Some(true) => Error::Deleted(key.describe()),
        Some(false) => Error::NotFound(format!("{} has no active version", key.describe())),
    })
}

async fn fetch_active(tx: &mut ScopedTx, key: FamilyKey<'_>) -> Result<SchemaRecord> {
    let row = key
        .bind(sqlx::query(&format!(
            "SELECT {} FROM schema_repository WHERE {} AND is_active AND NOT is_deleted",
            SCHEMA_COLUMNS,
            key.filter()
        )))
        .fetch_optional(tx.conn())
        .await
        .map_err(|e| db_error("load active schema", e))?;

    match row {
        Some(row) => row_to_schema(&row),
        None => Err(absence(tx, key).await?),
    }
}

fn row_to_schema(row: &PgRow) -> Result<SchemaRecord> {
    Ok(SchemaRecord {
        schema_id: column(row, "schema_id")?,
        schema_version: version_column(row, "schema_version")?,
        schema_definition: column(row, "schema_definition")?,
        hash: column(row, "hash")?,
        table_name: column(row, "table_name")?,
        slug: column(row, "slug")?,
        category_id: column(row, "category_id")?,
        created_at: column(row, "created_at")?,
        created_by: column(row, "created_by")?,
        is_active: column(row, "is_active")?,
        is_deleted: column(row, "is_deleted")?,
    })
}

#[async_trait]
impl SchemaStore for PostgresSchemaStore {
    async fn create_or_update_schema(&self, write: SchemaWrite) -> Result<SchemaRecord> {
        self.db
            .observed(STORE, "write", async {
                let mut tx = self.db.begin_admin().await?;
                let result = self.write_version(&mut tx, write).await;
                tx.finish(result).await
            })
            .await
    }

    async fn get_active_schema(&self, schema_id: Uuid) -> Result<SchemaRecord> {
        self.db
            .observed(STORE, "get_active", async {
                let mut tx = self.db.begin_admin().await?;
                let result = fetch_active(&mut tx, FamilyKey::Id(schema_id)).await;
                tx.finish(result).await
            })
            .await
    }

    async fn get_schema_by_version(
        &self,
        schema_id: Uuid,
        version: Version,
    ) -> Result<SchemaRecord> {
        self.db
            .observed(STORE, "get_version", async {
                let mut tx = self.db.begin_admin().await?;
                let result = match fetch_version(&mut tx, schema_id, version).await {
                    Ok(Some(record)) if record.is_deleted => Err(Error::Deleted(format!(
                        "Schema {}@{}",
                        schema_id, version
                    ))),
                    Ok(Some(record)) => Ok(record),
                    Ok(None) => Err(Error::NotFound(format!(
                        "Schema {}@{}",
                        schema_id, version
                    ))),
                    Err(e) => Err(e),
                };
                tx.finish(result).await
            })
            .await
    }

    async fn get_by_table_name(&self, table_name: &str) -> Result<SchemaRecord> {
        self.db
            .observed(STORE, "get_by_table", async {
                let table_name = ident::normalize_table_name(table_name)?;
                let mut tx = self.db.begin_admin().await?;
                let result = fetch_active(&mut tx, FamilyKey::Table(&table_name)).await;
                tx.finish(result).await
            })
            .await
    }

    async fn get_latest_by_slug(&self, slug: &str) -> Result<SchemaRecord> {
        self.db
            .observed(STORE, "get_by_slug", async {
                let slug = ident::normalize_slug(slug)?;
                let mut tx = self.db.begin_admin().await?;
                let result: Result<SchemaRecord> = async {
                    let row = sqlx::query(&format!(
                        "SELECT {} FROM schema_repository
                         WHERE slug = $1 AND NOT is_deleted
                         ORDER BY {} DESC
                         LIMIT 1",
                        SCHEMA_COLUMNS, VERSION_ORDER
                    ))
                    .bind(&slug)
                    .fetch_optional(tx.conn())
                    .await
                    .map_err(|e| db_error("load latest schema", e))?;

                    match row {
                        Some(row) => row_to_schema(&row),
                        None => Err(absence(&mut tx, FamilyKey::Slug(&slug)).await?),
                    }
                }
                .await;
                tx.finish(result).await
            })
            .await
    }

    async fn list_schemas(&self, query: SchemaListQuery) -> Result<Vec<SchemaRecord>> {
        self.db
            .observed(STORE, "list", async {
                let active_filter = if query.include_inactive {
                    ""
                } else {
                    "AND is_active"
                };
                let mut tx = self.db.begin_admin().await?;
                let result: Result<Vec<SchemaRecord>> = async {
                    // Active version first, then the highest remaining one
                    let rows = sqlx::query(&format!(
                        "SELECT * FROM (
                            SELECT DISTINCT ON (schema_id) {cols}
                            FROM schema_repository
                            WHERE NOT is_deleted {active}
                              AND ($1::uuid IS NULL OR category_id = $1)
                            ORDER BY schema_id, is_active DESC, {order} DESC
                         ) families
                         ORDER BY slug",
                        cols = SCHEMA_COLUMNS,
                        active = active_filter,
                        order = VERSION_ORDER
                    ))
                    .bind(query.category_id)
                    .fetch_all(tx.conn())
                    .await
                    .map_err(|e| db_error("list schemas", e))?;

                    rows.iter().map(row_to_schema).collect::<Result<Vec<_>>>()
                }
                .await;
                tx.finish(result).await
            })
            .await
    }

    async fn list_all_versions(&self, schema_id: Uuid) -> Result<Vec<SchemaRecord>> {
        self.db
            .observed(STORE, "list_versions", async {
                let mut tx = self.db.begin_admin().await?;
                let result: Result<Vec<SchemaRecord>> = async {
                    let rows = sqlx::query(&format!(
                        "SELECT {} FROM schema_repository WHERE schema_id = $1 ORDER BY {} DESC",
                        SCHEMA_COLUMNS, VERSION_ORDER
                    ))
                    .bind(schema_id)
                    .fetch_all(tx.conn())
                    .await
                    .map_err(|e| db_error("list schema versions", e))?;

                    if rows.is_empty() {
                        return Err(Error::NotFound(format!("Schema {}", schema_id)));
                    }
                    rows.iter().map(row_to_schema).collect::<Result<Vec<_>>>()
                }
                .await;
                tx.finish(result).await
            })
            .await
    }

    async fn activate_schema_version(
        &self,
        schema_id: Uuid,
        version: Version,
    ) -> Result<SchemaRecord> {
        self.db
            .observed(STORE, "activate", async {
                let mut tx = self.db.begin_admin().await?;
                let result: Result<SchemaRecord> = async {
                    tx.lock_key(&family_lock_key(schema_id)).await?;
                    activate(&mut tx, schema_id, version).await
                }
                .await;
                tx.finish(result).await
            })
            .await
    }

    async fn delete_schema(&self, schema_id: Uuid, version: Version) -> Result<()> {
        self.db
            .observed(STORE, "delete", async {
                let mut tx = self.db.begin_admin().await?;
                let result: Result<()> = async {
                    tx.lock_key(&family_lock_key(schema_id)).await?;
                    let deleted = sqlx::query(
                        "UPDATE schema_repository SET is_deleted = TRUE, is_active = FALSE
                         WHERE schema_id = $1 AND schema_version = $2 AND NOT is_deleted",
                    )
                    .bind(schema_id)
                    .bind(version.to_string())
                    .execute(tx.conn())
                    .await
                    .map_err(|e| db_error("delete schema version", e))?;

                    if deleted.rows_affected() == 0 {
                        return Err(Error::NotFound(format!(
                            "Schema {}@{}",
                            schema_id, version
                        )));
                    }
                    info!("Deleted schema {}@{}", schema_id, version);
                    Ok(())
                }
                .await;
                tx.finish(result).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_must_be_non_empty_object() {
        assert!(check_definition(&json!({"type": "object"})).is_ok());
        assert!(matches!(
            check_definition(&json!({})),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            check_definition(&json!(null)),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            check_definition(&json!({"type": "nonsense"})),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_family_names_must_match() {
        let normalize = ident::normalize_table_name;
        assert!(ensure_matches("table_name", "cards", None, normalize).is_ok());
        assert!(ensure_matches("table_name", "cards", Some(" Cards "), normalize).is_ok());

        let err = ensure_matches("table_name", "cards", Some("decks"), normalize).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_family_key_filters() {
        assert_eq!(FamilyKey::Id(Uuid::nil()).filter(), "schema_id = $1");
        assert_eq!(FamilyKey::Table("cards").filter(), "table_name = $1");
        assert_eq!(FamilyKey::Slug("cards").filter(), "slug = $1");
        assert_eq!(
            FamilyKey::Table("cards").describe(),
            "Schema for table cards"
        );
    }
}
