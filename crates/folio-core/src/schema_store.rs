//! Schema repository types and store trait
//!
//! A schema family is every version sharing one `schema_id`. The family's
//! `table_name` and `slug` are fixed by its first version; at most one
//! non-deleted version of a family is active at any time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, version::Version};

/// One persisted schema version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub schema_id: Uuid,
    pub schema_version: Version,
    pub schema_definition: serde_json::Value,
    pub hash: String,
    pub table_name: String,
    pub slug: String,
    pub category_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub is_active: bool,
    pub is_deleted: bool,
}

/// Write request for `create_or_update_schema`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaWrite {
    pub schema_id: Uuid,
    pub schema_version: Version,
    pub definition: serde_json::Value,
    /// Required for the first version of a family, must match afterwards
    pub table_name: Option<String>,
    /// Required for the first version of a family, must match afterwards
    pub slug: Option<String>,
    pub category_id: Uuid,
    pub created_by: String,
    /// Deactivate every other version of the family and activate this one
    #[serde(default)]
    pub activate: bool,
}

/// Filter for `list_schemas`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaListQuery {
    /// Restrict to one category
    pub category_id: Option<Uuid>,
    /// Include families without an active version (their latest version is returned)
    #[serde(default)]
    pub include_inactive: bool,
}

/// Administrative schema governance
///
/// Implementations run every mutating call inside one admin-scoped transaction.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Create a schema version, or re-submit an identical one
    ///
    /// # Errors
    /// - `Error::Validation` for missing fields or an invalid JSON Schema
    /// - `Error::Conflict` if `table_name`/`slug` differ from the family's
    ///   recorded values, are used by another family, or the version exists
    ///   with a different definition
    /// - `Error::Deleted` if the version was deleted
    async fn create_or_update_schema(&self, write: SchemaWrite) -> Result<SchemaRecord>;

    /// Active version of a family
    async fn get_active_schema(&self, schema_id: Uuid) -> Result<SchemaRecord>;

    /// One exact version
    ///
    /// # Errors
    /// - `Error::NotFound` if the version does not exist
    /// - `Error::Deleted` if it exists but was deleted
    async fn get_schema_by_version(&self, schema_id: Uuid, version: Version)
    -> Result<SchemaRecord>;

    /// Active version of the family owning `table_name`
    async fn get_by_table_name(&self, table_name: &str) -> Result<SchemaRecord>;

    /// Highest non-deleted version of the family owning `slug`
    async fn get_latest_by_slug(&self, slug: &str) -> Result<SchemaRecord>;

    /// One record per family, ordered by slug
    async fn list_schemas(&self, query: SchemaListQuery) -> Result<Vec<SchemaRecord>>;

    /// Every version of a family (deleted included), highest first
    async fn list_all_versions(&self, schema_id: Uuid) -> Result<Vec<SchemaRecord>>;

    /// Make `version` the only active version of its family
    ///
    /// # Errors
    /// - `Error::NotFound` / `Error::Deleted` for a missing target; the
    ///   previously active version stays active
    async fn activate_schema_version(&self, schema_id: Uuid, version: Version)
    -> Result<SchemaRecord>;

    /// Soft delete one version (terminal)
    async fn delete_schema(&self, schema_id: Uuid, version: Version) -> Result<()>;
}
