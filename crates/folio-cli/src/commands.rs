//! Subcommand definitions and their handlers

use anyhow::{Context, bail};
use clap::{Args, Subcommand};
use folio_core::hash::content_hash;
use folio_core::{
    CategoryStore, EntityQuery, EntityStore, EntityWrite, NewCategory, NewTenant,
    SchemaListQuery, SchemaStore, SchemaWrite, SortField, SortOrder, TenantId, TenantStore,
    Version,
};
use folio_postgres::{PostgresStores, SpaceDb, run_migrations};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use crate::config::FolioConfig;

#[derive(Subcommand)]
pub enum CategoryCommand {
    /// Create a category
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        slug: String,
        /// Parent category id (omit for a root category)
        #[arg(long)]
        parent: Option<Uuid>,
        #[arg(long)]
        id: Option<Uuid>,
    },
    /// Show one category
    Get { category_id: Uuid },
    /// List the children of a category, or the roots
    List {
        #[arg(long)]
        parent: Option<Uuid>,
    },
}

#[derive(Subcommand)]
pub enum TenantCommand {
    /// Register a tenant (status `pending`)
    Create {
        #[arg(long)]
        slug: String,
        #[arg(long)]
        id: Option<TenantId>,
        /// Provision schema and role right away
        #[arg(long, default_value = "false")]
        provision: bool,
    },
    /// Create the tenant's schema and role
    Provision { tenant_id: TenantId },
    /// Show the current version of a tenant
    Get { tenant_id: TenantId },
    /// Look a tenant up by slug
    Find { slug: String },
    /// List tenants
    List {
        #[arg(long, default_value = "false")]
        include_deleted: bool,
    },
    /// Show every version of a tenant
    Versions { tenant_id: TenantId },
    /// Show the execution scope of an active tenant
    Resolve { tenant_id: TenantId },
    /// Delete a tenant (terminal)
    Delete { tenant_id: TenantId },
}

#[derive(Subcommand)]
pub enum SchemaCommand {
    /// Create a schema version, or re-submit an identical one
    Put {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        version: Version,
        /// JSON Schema document
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        category: Uuid,
        /// Required for the first version of a family
        #[arg(long)]
        table_name: Option<String>,
        /// Required for the first version of a family
        #[arg(long)]
        slug: Option<String>,
        #[arg(long, default_value = "false")]
        activate: bool,
    },
    /// Check a payload against the schema without writing it
    Validate {
        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// Show the active version, or one exact version
    Get {
        schema_id: Uuid,
        #[arg(long)]
        version: Option<Version>,
    },
    /// Find a family by table name or slug
    Find {
        #[arg(long, conflicts_with = "slug", required_unless_present = "slug")]
        table_name: Option<String>,
        #[arg(long)]
        slug: Option<String>,
    },
    /// List schema families
    List {
        #[arg(long)]
        category: Option<Uuid>,
        #[arg(long, default_value = "false")]
        include_inactive: bool,
    },
    /// Show every version of a family
    Versions { schema_id: Uuid },
    /// Make one version the family's only active version
    Activate { schema_id: Uuid, version: Version },
    /// Delete one version (terminal)
    Delete { schema_id: Uuid, version: Version },
}

#[derive(Args)]
pub struct EntityCommand {
    /// Tenant the entities belong to
    #[arg(long)]
    tenant: TenantId,

    /// Schema family of the entities
    #[arg(long)]
    schema: Uuid,

    #[command(subcommand)]
    action: EntityAction,
}

#[derive(Args)]
pub struct PayloadArgs {
    /// Inline JSON payload
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    payload: Option<String>,

    /// File holding the JSON payload
    #[arg(long)]
    file: Option<PathBuf>,

    /// Validate against this schema version instead of the active one
    #[arg(long)]
    schema_version: Option<Version>,
}

#[derive(Subcommand)]
pub enum EntityAction {
    /// Create an entity at version 1.0.0
    Create {
        /// Generated when omitted
        #[arg(long)]
        id: Option<String>,
        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// Append a new version to an existing entity
    Update {
        #[arg(long)]
        id: String,
        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// Update, or create when the entity does not exist
    Upsert {
        #[arg(long)]
        id: String,
        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// Check a payload against the schema without writing it
    Validate {
        #[command(flatten)]
        payload: PayloadArgs,
    },
    /// Show the active version, or one exact version
    Get {
        entity_id: String,
        #[arg(long)]
        version: Option<Version>,
    },
    /// Show the full version chain of an entity
    History { entity_id: String },
    /// List entities
    List {
        #[arg(long, default_value_t = folio_core::entity_store::DEFAULT_LIST_LIMIT)]
        limit: u32,
        #[arg(long, default_value = "0")]
        offset: u32,
        /// created_at, entity_id or entity_version
        #[arg(long, default_value = "created_at")]
        sort: SortField,
        #[arg(long, default_value = "desc")]
        order: SortOrder,
        /// Include superseded and deleted versions
        #[arg(long, default_value = "false")]
        all_versions: bool,
    },
    /// Count active entities (or every version with --all-versions)
    Count {
        #[arg(long, default_value = "false")]
        all_versions: bool,
    },
    /// Delete an entity (terminal)
    Delete { entity_id: String },
}

pub async fn connect(config: &FolioConfig) -> anyhow::Result<PostgresStores> {
    let stores = PostgresStores::connect(config.database_url()?, config.store_config())
        .await
        .context("Failed to open Folio stores")?;
    Ok(stores)
}

pub async fn migrate(config: &FolioConfig) -> anyhow::Result<Value> {
    let db = SpaceDb::connect(config.database_url()?, config.store_config()).await?;
    let applied = run_migrations(&db).await?;
    info!("Applied {} migrations to {}", applied, db.admin_schema());
    Ok(json!({
        "admin_schema": db.admin_schema(),
        "applied": applied,
    }))
}

pub async fn category(
    stores: &PostgresStores,
    command: CategoryCommand,
    actor: &str,
) -> anyhow::Result<Value> {
    let categories = stores.categories();
    match command {
        CategoryCommand::Create {
            name,
            slug,
            parent,
            id,
        } => to_json(
            categories
                .create_category(NewCategory {
                    category_id: id,
                    parent_id: parent,
                    name,
                    slug,
                    created_by: actor.to_string(),
                })
                .await?,
        ),
        CategoryCommand::Get { category_id } => {
            to_json(categories.get_category(category_id).await?)
        }
        CategoryCommand::List { parent } => to_json(categories.list_categories(parent).await?),
    }
}

pub async fn tenant(
    stores: &PostgresStores,
    command: TenantCommand,
    actor: &str,
) -> anyhow::Result<Value> {
    let tenants = stores.tenants();
    match command {
        TenantCommand::Create {
            slug,
            id,
            provision,
        } => {
            let record = tenants
                .create_tenant(NewTenant {
                    tenant_id: id,
                    slug,
                    created_by: actor.to_string(),
                })
                .await?;
            if provision {
                return to_json(tenants.provision_tenant(record.tenant_id, actor).await?);
            }
            to_json(record)
        }
        TenantCommand::Provision { tenant_id } => {
            to_json(tenants.provision_tenant(tenant_id, actor).await?)
        }
        TenantCommand::Get { tenant_id } => to_json(tenants.get_tenant(tenant_id).await?),
        TenantCommand::Find { slug } => to_json(tenants.get_tenant_by_slug(&slug).await?),
        TenantCommand::List { include_deleted } => {
            to_json(tenants.list_tenants(include_deleted).await?)
        }
        TenantCommand::Versions { tenant_id } => {
            to_json(tenants.list_tenant_versions(tenant_id).await?)
        }
        TenantCommand::Resolve { tenant_id } => to_json(tenants.resolve_space(tenant_id).await?),
        TenantCommand::Delete { tenant_id } => {
            to_json(tenants.delete_tenant(tenant_id, actor).await?)
        }
    }
}

pub async fn schema(
    stores: &PostgresStores,
    command: SchemaCommand,
    actor: &str,
) -> anyhow::Result<Value> {
    let schemas = stores.schemas();
    match command {
        SchemaCommand::Put {
            id,
            version,
            file,
            category,
            table_name,
            slug,
            activate,
        } => {
            let definition = read_json(&file)?;
            to_json(
                schemas
                    .create_or_update_schema(SchemaWrite {
                        schema_id: id,
                        schema_version: version,
                        definition,
                        table_name,
                        slug,
                        category_id: category,
                        created_by: actor.to_string(),
                        activate,
                    })
                    .await?,
            )
        }
        SchemaCommand::Get { schema_id, version } => match version {
            Some(version) => to_json(schemas.get_schema_by_version(schema_id, version).await?),
            None => to_json(schemas.get_active_schema(schema_id).await?),
        },
        SchemaCommand::Find { table_name, slug } => match (table_name, slug) {
            (Some(table_name), _) => to_json(schemas.get_by_table_name(&table_name).await?),
            (None, Some(slug)) => to_json(schemas.get_latest_by_slug(&slug).await?),
            (None, None) => bail!("Either --table-name or --slug is required"),
        },
        SchemaCommand::List {
            category,
            include_inactive,
        } => to_json(
            schemas
                .list_schemas(SchemaListQuery {
                    category_id: category,
                    include_inactive,
                })
                .await?,
        ),
        SchemaCommand::Versions { schema_id } => {
            to_json(schemas.list_all_versions(schema_id).await?)
        }
        SchemaCommand::Activate { schema_id, version } => {
            to_json(schemas.activate_schema_version(schema_id, version).await?)
        }
        SchemaCommand::Delete { schema_id, version } => {
            schemas.delete_schema(schema_id, version).await?;
            Ok(json!({
                "schema_id": schema_id,
                "schema_version": version,
                "deleted": true,
            }))
        }
    }
}

pub async fn entity(
    stores: &PostgresStores,
    command: EntityCommand,
    actor: &str,
) -> anyhow::Result<Value> {
    // Validation reads the schema repository only; no tenant scope needed
    let action = match command.action {
        EntityAction::Validate { payload } => {
            return validate_payload(stores, command.schema, payload).await;
        }
        action => action,
    };

    let space = stores.tenants().resolve_space(command.tenant).await?;
    let repo = stores.entity_repository(command.schema).await?;

    match action {
        EntityAction::Validate { .. } => bail!("validate does not write entities"),
        EntityAction::Create { id, payload } => {
            let mut write = payload.into_write(actor)?;
            write.entity_id = id;
            to_json(repo.create_entity(&space, write).await?)
        }
        EntityAction::Update { id, payload } => {
            let write = payload.into_write(actor)?.with_entity_id(id);
            to_json(repo.update_entity(&space, write).await?)
        }
        EntityAction::Upsert { id, payload } => {
            let write = payload.into_write(actor)?.with_entity_id(id);
            to_json(repo.create_or_update_entity(&space, write).await?)
        }
        EntityAction::Get { entity_id, version } => match version {
            Some(version) => to_json(repo.get_entity_version(&space, &entity_id, version).await?),
            None => to_json(repo.get_entity_by_id(&space, &entity_id).await?),
        },
        EntityAction::History { entity_id } => {
            to_json(repo.list_entity_versions(&space, &entity_id).await?)
        }
        EntityAction::List {
            limit,
            offset,
            sort,
            order,
            all_versions,
        } => {
            let query = entity_query(all_versions)
                .with_page(limit, offset)
                .with_sort(sort, order);
            to_json(repo.list_entities(&space, &query).await?)
        }
        EntityAction::Count { all_versions } => {
            let count = repo
                .count_entities(&space, &entity_query(all_versions))
                .await?;
            Ok(json!({ "count": count }))
        }
        EntityAction::Delete { entity_id } => {
            repo.soft_delete_entity(&space, &entity_id).await?;
            Ok(json!({ "entity_id": entity_id, "deleted": true }))
        }
    }
}

async fn validate_payload(
    stores: &PostgresStores,
    schema_id: Uuid,
    payload: PayloadArgs,
) -> anyhow::Result<Value> {
    let schemas = stores.schemas();
    let schema = match payload.schema_version {
        Some(version) => schemas.get_schema_by_version(schema_id, version).await?,
        None => schemas.get_active_schema(schema_id).await?,
    };
    let value = stores
        .validator()
        .validate_bytes(&schema, &payload.raw_bytes()?)?;
    Ok(json!({
        "schema_id": schema.schema_id,
        "schema_version": schema.schema_version,
        "hash": content_hash(&value),
        "valid": true,
    }))
}

impl PayloadArgs {
    /// Payload exactly as supplied, unparsed
    fn raw_bytes(&self) -> anyhow::Result<Vec<u8>> {
        match (&self.payload, &self.file) {
            (Some(inline), _) => Ok(inline.clone().into_bytes()),
            (None, Some(file)) => {
                let path = shellexpand::tilde(&file.to_string_lossy()).to_string();
                std::fs::read(&path).with_context(|| format!("Failed to read {}", path))
            }
            (None, None) => bail!("Either --payload or --file is required"),
        }
    }

    fn into_write(self, actor: &str) -> anyhow::Result<EntityWrite> {
        let payload = match (self.payload, self.file) {
            (Some(inline), _) => {
                serde_json::from_str(&inline).context("--payload is not valid JSON")?
            }
            (None, Some(file)) => read_json(&file)?,
            (None, None) => bail!("Either --payload or --file is required"),
        };
        let write = EntityWrite::new(payload, actor);
        Ok(match self.schema_version {
            Some(version) => write.with_schema_version(version),
            None => write,
        })
    }
}

fn entity_query(all_versions: bool) -> EntityQuery {
    if all_versions {
        EntityQuery::all_versions()
    } else {
        EntityQuery::default()
    }
}

fn read_json(path: &std::path::Path) -> anyhow::Result<Value> {
    let path = shellexpand::tilde(&path.to_string_lossy()).to_string();
    let contents =
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("{} is not valid JSON", path))
}

fn to_json<T: Serialize>(value: T) -> anyhow::Result<Value> {
    Ok(serde_json::to_value(value)?)
}
