//! PostgresCategoryStore - CategoryStore implementation over the admin schema

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use uuid::Uuid;

use crate::errors::{column, db_error, insert_error};
use crate::space_db::{ScopedTx, SpaceDb};
use folio_core::{
    CategoryRecord, CategoryStore, Error, NewCategory, Result, ident::normalize_slug,
};

const STORE: &str = "category";

const CATEGORY_COLUMNS: &str = "category_id, parent_id, name, slug, created_at, created_by";

#[derive(Clone)]
pub struct PostgresCategoryStore {
    db: SpaceDb,
}

impl PostgresCategoryStore {
    pub fn new(db: SpaceDb) -> Self {
        Self { db }
    }

    async fn insert(&self, tx: &mut ScopedTx, category: NewCategory) -> Result<CategoryRecord> {
        let name = category.name.trim();
        if name.is_empty() {
            return Err(Error::Validation("Category name must not be empty".to_string()));
        }
        let slug = normalize_slug(&category.slug)?;
        let category_id = category.category_id.unwrap_or_else(Uuid::new_v4);

        if let Some(parent_id) = category.parent_id {
            fetch(tx, parent_id).await.map_err(|e| match e {
                Error::NotFound(_) => {
                    Error::NotFound(format!("Parent category {} does not exist", parent_id))
                }
                other => other,
            })?;
        }

        let row = sqlx::query(&format!(
            "INSERT INTO categories (category_id, parent_id, name, slug, created_by)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {}",
            CATEGORY_COLUMNS
        ))
        .bind(category_id)
        .bind(category.parent_id)
        .bind(name)
        .bind(&slug)
        .bind(&category.created_by)
        .fetch_one(tx.conn())
        .await
        .map_err(|e| {
            insert_error(
                "insert category",
                &format!("category {} / slug {}", category_id, slug),
                e,
            )
        })?;

        row_to_category(&row)
    }
}

async fn fetch(tx: &mut ScopedTx, category_id: Uuid) -> Result<CategoryRecord> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM categories WHERE category_id = $1",
        CATEGORY_COLUMNS
    ))
    .bind(category_id)
    .fetch_optional(tx.conn())
    .await
    .map_err(|e| db_error("load category", e))?
    .ok_or_else(|| Error::NotFound(format!("Category {}", category_id)))?;

    row_to_category(&row)
}

fn row_to_category(row: &PgRow) -> Result<CategoryRecord> {
    Ok(CategoryRecord {
        category_id: column(row, "category_id")?,
        parent_id: column(row, "parent_id")?,
        name: column(row, "name")?,
        slug: column(row, "slug")?,
        created_at: column(row, "created_at")?,
        created_by: column(row, "created_by")?,
    })
}

#[async_trait]
impl CategoryStore for PostgresCategoryStore {
    async fn create_category(&self, category: NewCategory) -> Result<CategoryRecord> {
        self.db
            .observed(STORE, "create", async {
                let mut tx = self.db.begin_admin().await?;
                let result = self.insert(&mut tx, category).await;
                tx.finish(result).await
            })
            .await
    }

    async fn get_category(&self, category_id: Uuid) -> Result<CategoryRecord> {
        self.db
            .observed(STORE, "get", async {
                let mut tx = self.db.begin_admin().await?;
                let result = fetch(&mut tx, category_id).await;
                tx.finish(result).await
            })
            .await
    }

    async fn list_categories(&self, parent_id: Option<Uuid>) -> Result<Vec<CategoryRecord>> {
        self.db
            .observed(STORE, "list", async {
                let mut tx = self.db.begin_admin().await?;
                let result: Result<Vec<CategoryRecord>> = async {
                    let rows = sqlx::query(&format!(
                        "SELECT {} FROM categories
                         WHERE parent_id IS NOT DISTINCT FROM $1
                         ORDER BY name, slug",
                        CATEGORY_COLUMNS
                    ))
                    .bind(parent_id)
                    .fetch_all(tx.conn())
                    .await
                    .map_err(|e| db_error("list categories", e))?;

                    rows.iter().map(row_to_category).collect::<Result<Vec<_>>>()
                }
                .await;
                tx.finish(result).await
            })
            .await
    }
}
