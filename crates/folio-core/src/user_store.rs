//! Per-tenant user accounts

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, tenant::TenantSpace};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub roles: Vec<String>,
    pub is_active: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    /// Generated when absent
    pub user_id: Option<Uuid>,
    pub email: String,
    pub display_name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub created_by: String,
}

/// Partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub roles: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuery {
    pub include_deleted: bool,
    pub limit: u32,
    pub offset: u32,
}

impl Default for UserQuery {
    fn default() -> Self {
        Self {
            include_deleted: false,
            limit: crate::entity_store::DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

/// Tenant-scoped user accounts
///
/// Emails are unique (case-insensitively) among non-deleted users of one tenant.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// # Errors
    /// - `Error::AlreadyExists` if the id or email is taken
    /// - `Error::Validation` for a malformed email
    async fn create_user(&self, space: &TenantSpace, user: NewUser) -> Result<UserRecord>;

    /// # Errors
    /// - `Error::NotFound` if the user does not exist
    /// - `Error::Deleted` if the user was deleted
    async fn get_user(&self, space: &TenantSpace, user_id: Uuid) -> Result<UserRecord>;

    async fn get_user_by_email(&self, space: &TenantSpace, email: &str) -> Result<UserRecord>;

    /// Users ordered by email
    async fn list_users(&self, space: &TenantSpace, query: &UserQuery) -> Result<Vec<UserRecord>>;

    async fn update_user(
        &self,
        space: &TenantSpace,
        user_id: Uuid,
        update: UserUpdate,
    ) -> Result<UserRecord>;

    /// Soft delete (terminal)
    async fn delete_user(&self, space: &TenantSpace, user_id: Uuid) -> Result<()>;
}
