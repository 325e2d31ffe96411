//! Classification tree referenced by schema families

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRecord {
    pub category_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCategory {
    /// Generated when absent
    pub category_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub slug: String,
    pub created_by: String,
}

#[async_trait]
pub trait CategoryStore: Send + Sync {
    /// # Errors
    /// - `Error::NotFound` if `parent_id` does not exist
    /// - `Error::AlreadyExists` if the id or slug is taken
    async fn create_category(&self, category: NewCategory) -> Result<CategoryRecord>;

    async fn get_category(&self, category_id: Uuid) -> Result<CategoryRecord>;

    /// Direct children of `parent_id`, or the roots when `None`, ordered by name
    async fn list_categories(&self, parent_id: Option<Uuid>) -> Result<Vec<CategoryRecord>>;
}
