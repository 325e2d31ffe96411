//! Entity repository types and store trait
//!
//! Entities are append-only: an update never rewrites a row, it flips the
//! current row inactive and inserts `patch + 1`. Exactly one non-deleted row
//! per entity id is active.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result, tenant::TenantSpace, version::Version};

/// Default page size for `list_entities`
pub const DEFAULT_LIST_LIMIT: u32 = 50;

/// Upper bound for a single page
pub const MAX_LIST_LIMIT: u32 = 1000;

/// One persisted entity version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: String,
    pub entity_version: Version,
    pub schema_id: Uuid,
    pub schema_version: Version,
    pub payload: serde_json::Value,
    pub hash: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub is_active: bool,
    pub is_deleted: bool,
}

/// Create or update request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityWrite {
    /// Generated on create when absent; required on update
    pub entity_id: Option<String>,
    pub payload: serde_json::Value,
    /// Pin a schema version; the family's active version is used when absent
    pub schema_version: Option<Version>,
    pub created_by: String,
}

impl EntityWrite {
    pub fn new(payload: serde_json::Value, created_by: impl Into<String>) -> Self {
        Self {
            entity_id: None,
            payload,
            schema_version: None,
            created_by: created_by.into(),
        }
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_schema_version(mut self, version: Version) -> Self {
        self.schema_version = Some(version);
        self
    }
}

/// Sortable columns. Anything outside this list is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    EntityId,
    EntityVersion,
}

impl SortField {
    /// SQL expression for ORDER BY
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::EntityId => "entity_id",
            SortField::EntityVersion => "string_to_array(entity_version, '.')::int[]",
        }
    }
}

impl FromStr for SortField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created_at" | "createdAt" => Ok(SortField::CreatedAt),
            "entity_id" | "entityId" => Ok(SortField::EntityId),
            "entity_version" | "entityVersion" => Ok(SortField::EntityVersion),
            other => Err(Error::Validation(format!("Unsupported sort field '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(Error::Validation(format!("Unsupported sort order '{}'", s))),
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Filter and paging for `list_entities` / `count_entities`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityQuery {
    /// Only the current row of each entity (superseded versions excluded)
    pub only_active: bool,
    /// Include soft-deleted rows
    pub include_deleted: bool,
    pub limit: u32,
    pub offset: u32,
    pub sort_field: SortField,
    pub sort_order: SortOrder,
}

impl Default for EntityQuery {
    fn default() -> Self {
        Self {
            only_active: true,
            include_deleted: false,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
            sort_field: SortField::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl EntityQuery {
    /// Every row: superseded and deleted versions included
    pub fn all_versions() -> Self {
        Self {
            only_active: false,
            include_deleted: true,
            ..Self::default()
        }
    }

    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn with_page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    pub fn with_sort(mut self, field: SortField, order: SortOrder) -> Self {
        self.sort_field = field;
        self.sort_order = order;
        self
    }

    /// Page size clamped to `1..=MAX_LIST_LIMIT`
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }

    /// WHERE clause for this filter (no leading keyword), or `None` for no filter.
    ///
    /// Superseded rows are `!is_active && !is_deleted`; the row of a deleted
    /// entity is `!is_active && is_deleted` and still counts as its current row.
    pub fn filter_sql(&self) -> Option<&'static str> {
        match (self.only_active, self.include_deleted) {
            (true, false) => Some("is_active AND NOT is_deleted"),
            (true, true) => Some("(is_active OR is_deleted)"),
            (false, false) => Some("NOT is_deleted"),
            (false, true) => None,
        }
    }
}

/// Tenant-scoped document storage for one schema family
///
/// Every call takes the caller's `TenantSpace`; implementations run each call
/// in exactly one tenant-scoped transaction.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Schema family this repository is bound to
    fn schema_id(&self) -> Uuid;

    /// Insert version `1.0.0` of a new entity
    ///
    /// # Errors
    /// - `Error::AlreadyExists` if the id has any row, including under a
    ///   concurrent create of the same id
    /// - `Error::Validation` / `Error::SchemaViolation` for bad input
    async fn create_entity(&self, space: &TenantSpace, write: EntityWrite) -> Result<EntityRecord>;

    /// Append `patch + 1` and make it the active version
    ///
    /// # Errors
    /// - `Error::NotFound` if the id has no active row
    async fn update_entity(&self, space: &TenantSpace, write: EntityWrite) -> Result<EntityRecord>;

    /// Update, falling back to create when the entity does not exist
    async fn create_or_update_entity(
        &self,
        space: &TenantSpace,
        write: EntityWrite,
    ) -> Result<EntityRecord> {
        if write.entity_id.is_some() {
            match self.update_entity(space, write.clone()).await {
                Err(Error::NotFound(_)) => {}
                other => return other,
            }
        }
        self.create_entity(space, write).await
    }

    /// Active version of an entity
    async fn get_entity_by_id(&self, space: &TenantSpace, entity_id: &str) -> Result<EntityRecord>;

    /// One exact version, whatever its state
    async fn get_entity_version(
        &self,
        space: &TenantSpace,
        entity_id: &str,
        version: Version,
    ) -> Result<EntityRecord>;

    /// Full version chain of an entity, oldest first
    async fn list_entity_versions(
        &self,
        space: &TenantSpace,
        entity_id: &str,
    ) -> Result<Vec<EntityRecord>>;

    async fn list_entities(
        &self,
        space: &TenantSpace,
        query: &EntityQuery,
    ) -> Result<Vec<EntityRecord>>;

    /// Rows matching the query filter (paging ignored)
    async fn count_entities(&self, space: &TenantSpace, query: &EntityQuery) -> Result<u64>;

    /// Flag the active row deleted and inactive in place
    ///
    /// # Errors
    /// - `Error::NotFound` if the id has no active row
    async fn soft_delete_entity(&self, space: &TenantSpace, entity_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_field_allow_list() {
        assert_eq!("created_at".parse::<SortField>().unwrap(), SortField::CreatedAt);
        assert_eq!("entityId".parse::<SortField>().unwrap(), SortField::EntityId);
        assert!("payload".parse::<SortField>().is_err());
        assert!("created_at; drop table x".parse::<SortField>().is_err());
    }

    #[test]
    fn test_sort_order_parse() {
        assert_eq!("ASC".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert_eq!("desc".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert!("sideways".parse::<SortOrder>().is_err());
    }

    #[test]
    fn test_query_filters() {
        assert_eq!(
            EntityQuery::default().filter_sql(),
            Some("is_active AND NOT is_deleted")
        );
        assert_eq!(EntityQuery::all_versions().filter_sql(), None);
        assert_eq!(
            EntityQuery::default().with_deleted().filter_sql(),
            Some("(is_active OR is_deleted)")
        );

        let history = EntityQuery {
            only_active: false,
            ..EntityQuery::default()
        };
        assert_eq!(history.filter_sql(), Some("NOT is_deleted"));
    }

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(EntityQuery::default().with_page(0, 0).effective_limit(), 1);
        assert_eq!(
            EntityQuery::default().with_page(10_000, 0).effective_limit(),
            MAX_LIST_LIMIT
        );
        assert_eq!(EntityQuery::default().effective_limit(), DEFAULT_LIST_LIMIT);
    }

    #[test]
    fn test_write_builder() {
        let write = EntityWrite::new(serde_json::json!({"name": "Mox Pearl"}), "alice")
            .with_entity_id("mox-pearl")
            .with_schema_version(Version::new(1, 1, 0));
        assert_eq!(write.entity_id.as_deref(), Some("mox-pearl"));
        assert_eq!(write.schema_version, Some(Version::new(1, 1, 0)));
    }
}
