//! Tenant types, tenant spaces and the tenant registry contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result, ident, version::Version};

/// Stable identity of a tenant across all of its registry versions.
///
/// The first eight hex digits name the tenant's database role and schema, see
/// [`TenantSpace::derive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    /// Random v4 id for a tenant registered without one
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// # Errors
    /// - `Error::Validation` if `s` is not a UUID
    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Validation(format!("Invalid tenant ID '{}': {}", s, e)))
    }

    /// Prefix used in derived database names, e.g. `1a2b3c4d`
    pub fn short(&self) -> String {
        let mut simple = self.0.simple().to_string();
        simple.truncate(8);
        simple
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TenantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_string(s)
    }
}

/// Runtime execution scope of one tenant.
///
/// Resolved once per request (claim + registry lookup) and passed explicitly
/// into every tenant-scoped store call. Never persisted as such.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSpace {
    pub tenant_id: TenantId,
    pub slug: String,
    pub short_tenant_id: String,
    /// Database schema holding this tenant's tables
    pub schema_name: String,
    /// Database role every tenant transaction switches to
    pub role_name: String,
    /// Storage prefix for tenant-owned blobs
    pub base_prefix: String,
}

impl TenantSpace {
    /// Derive the canonical space for a tenant.
    ///
    /// `tenant_1a2b3c4d` / `tenant_1a2b3c4d_rw` / `tenants/1a2b3c4d/`
    pub fn derive(tenant_id: TenantId, slug: &str) -> Result<Self> {
        let slug = ident::normalize_slug(slug)?;
        let short = tenant_id.short();
        Ok(Self {
            tenant_id,
            slug,
            schema_name: format!("tenant_{}", short),
            role_name: format!("tenant_{}_rw", short),
            base_prefix: format!("tenants/{}/", short),
            short_tenant_id: short,
        })
    }

    /// Check the database-facing names before they reach SQL.
    ///
    /// # Errors
    /// - `Error::TenantRequired` if the role name is empty
    /// - `Error::Validation` if the schema or role name is malformed
    pub fn validate(&self) -> Result<()> {
        if self.role_name.trim().is_empty() {
            return Err(Error::TenantRequired(format!(
                "Tenant {} has no database role",
                self.tenant_id
            )));
        }
        ident::validate_db_name("schema name", &self.schema_name)?;
        ident::validate_db_name("role name", &self.role_name)
    }
}

/// Lifecycle state of a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Pending,
    Active,
    Suspended,
    Failed,
    Deleted,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Pending => "pending",
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Failed => "failed",
            TenantStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TenantStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TenantStatus::Pending),
            "active" => Ok(TenantStatus::Active),
            "suspended" => Ok(TenantStatus::Suspended),
            "failed" => Ok(TenantStatus::Failed),
            "deleted" => Ok(TenantStatus::Deleted),
            other => Err(Error::Validation(format!("Unknown tenant status '{}'", other))),
        }
    }
}

/// One immutable version of a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant_id: TenantId,
    pub tenant_version: Version,
    pub slug: String,
    pub schema_name: String,
    pub role_name: String,
    pub base_prefix: String,
    pub status: TenantStatus,
    pub db_ready: bool,
    pub auth_ready: bool,
    pub last_provisioned_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub is_active: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

impl TenantRecord {
    /// The execution scope described by this version.
    pub fn space(&self) -> TenantSpace {
        TenantSpace {
            tenant_id: self.tenant_id,
            slug: self.slug.clone(),
            short_tenant_id: self.tenant_id.short(),
            schema_name: self.schema_name.clone(),
            role_name: self.role_name.clone(),
            base_prefix: self.base_prefix.clone(),
        }
    }
}

/// Registration request for a new tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTenant {
    /// Generated when absent
    pub tenant_id: Option<TenantId>,
    pub slug: String,
    pub created_by: String,
}

/// Field changes carried by an appended tenant version.
///
/// `None` fields carry forward from the current version, except
/// `last_error`, which is always replaced (so a successful transition clears it).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantChange {
    pub status: Option<TenantStatus>,
    pub db_ready: Option<bool>,
    pub auth_ready: Option<bool>,
    pub last_error: Option<String>,
    /// Stamp `last_provisioned_at` with the current time
    pub provisioned: bool,
}

/// Tenant registry
///
/// Tenants are append-only: every change inserts a new version and flips the
/// previous one inactive, under a per-tenant lock.
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Register a tenant at version `1.0.0` with status `pending`
    ///
    /// # Errors
    /// - `Error::AlreadyExists` if the id, slug or derived schema is taken
    /// - `Error::Validation` for a malformed slug
    async fn create_tenant(&self, tenant: NewTenant) -> Result<TenantRecord>;

    /// Current version of a tenant
    ///
    /// # Errors
    /// - `Error::NotFound` if the tenant was never registered
    /// - `Error::Deleted` if the tenant was deleted
    async fn get_tenant(&self, tenant_id: TenantId) -> Result<TenantRecord>;

    /// Current version of the tenant owning `slug`
    async fn get_tenant_by_slug(&self, slug: &str) -> Result<TenantRecord>;

    /// Latest version of every tenant, ordered by slug
    async fn list_tenants(&self, include_deleted: bool) -> Result<Vec<TenantRecord>>;

    /// Every version of a tenant, oldest first
    async fn list_tenant_versions(&self, tenant_id: TenantId) -> Result<Vec<TenantRecord>>;

    /// Append a new version carrying `change`
    async fn append_tenant_version(
        &self,
        tenant_id: TenantId,
        change: TenantChange,
        created_by: &str,
    ) -> Result<TenantRecord>;

    /// Create the tenant's schema and role, grant access, and record the
    /// outcome as a new version (`active` on success, `failed` otherwise)
    async fn provision_tenant(&self, tenant_id: TenantId, created_by: &str)
    -> Result<TenantRecord>;

    /// Resolve the execution scope of an active, provisioned tenant
    ///
    /// # Errors
    /// - `Error::Validation` if the tenant is not active or not provisioned
    async fn resolve_space(&self, tenant_id: TenantId) -> Result<TenantSpace>;

    /// Append a terminal deleted version
    async fn delete_tenant(&self, tenant_id: TenantId, deleted_by: &str) -> Result<TenantRecord>;
}
