//! PostgresUserStore - UserStore implementation inside tenant schemas

use async_trait::async_trait;
use sqlx::Executor;
use sqlx::postgres::PgRow;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{column, db_error, insert_error};
use crate::space_db::{EnsuredTables, ScopedTx, SpaceDb};
use folio_core::{
    Error, NewUser, Result, TenantSpace, UserQuery, UserRecord, UserStore, UserUpdate,
    entity_store::MAX_LIST_LIMIT,
    ident::{self, quote_ident},
};

const STORE: &str = "user";

const USER_COLUMNS: &str = "user_id, email, display_name, roles, is_active, is_deleted, \
     created_at, updated_at, created_by";

/// PostgreSQL-backed user accounts, one `users` table per tenant schema
pub struct PostgresUserStore {
    db: SpaceDb,
    ensured: EnsuredTables,
}

impl PostgresUserStore {
    pub fn new(db: SpaceDb) -> Self {
        Self {
            db,
            ensured: EnsuredTables::default(),
        }
    }

    async fn begin(&self, space: &TenantSpace) -> Result<ScopedTx> {
        let mut tx = self.db.begin_tenant(space).await?;
        if !self.ensured.contains(&space.schema_name) {
            tx.lock_key(&format!("folio:table:{}.users", space.schema_name))
                .await?;
            let ddl = users_ddl(&space.schema_name);
            Executor::execute(tx.conn(), sqlx::raw_sql(&ddl))
                .await
                .map_err(|e| db_error("ensure users table", e))?;
        }
        Ok(tx)
    }

    async fn complete<T>(&self, space: &TenantSpace, tx: ScopedTx, result: Result<T>) -> Result<T> {
        let result = tx.finish(result).await;
        if result.is_ok() {
            self.ensured.mark(&space.schema_name);
        }
        result
    }

    async fn run<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.db.observed(STORE, operation, fut).await
    }
}

fn users_ddl(tenant_schema: &str) -> String {
    let qualified = format!("{}.users", quote_ident(tenant_schema));
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {qualified} (
            user_id UUID PRIMARY KEY,
            email TEXT NOT NULL,
            display_name TEXT,
            roles TEXT[] NOT NULL DEFAULT '{{}}',
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            created_by TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS users_email_uq
        ON {qualified} (lower(email)) WHERE NOT is_deleted
        "#,
        qualified = qualified
    )
}

/// Trimmed, non-empty, de-duplicated roles in their original order
fn normalize_roles(roles: Vec<String>) -> Result<Vec<String>> {
    let mut normalized: Vec<String> = Vec::with_capacity(roles.len());
    for role in roles {
        let role = role.trim();
        if role.is_empty() {
            return Err(Error::Validation("Role names must not be empty".to_string()));
        }
        if !normalized.iter().any(|r| r == role) {
            normalized.push(role.to_string());
        }
    }
    Ok(normalized)
}

fn normalize_display_name(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

async fn ensure_email_free(tx: &mut ScopedTx, email: &str, except: Option<Uuid>) -> Result<()> {
    let taken: bool = sqlx::query_scalar(
        "SELECT EXISTS(
            SELECT 1 FROM users
            WHERE lower(email) = $1 AND NOT is_deleted
              AND ($2::uuid IS NULL OR user_id <> $2)
        )",
    )
    .bind(email)
    .bind(except)
    .fetch_one(tx.conn())
    .await
    .map_err(|e| db_error("check user email", e))?;

    if taken {
        Err(Error::AlreadyExists(format!("User with email {}", email)))
    } else {
        Ok(())
    }
}

async fn fetch_user(tx: &mut ScopedTx, user_id: Uuid, for_update: bool) -> Result<UserRecord> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM users WHERE user_id = $1{}",
        USER_COLUMNS,
        if for_update { " FOR UPDATE" } else { "" }
    ))
    .bind(user_id)
    .fetch_optional(tx.conn())
    .await
    .map_err(|e| db_error("load user", e))?
    .ok_or_else(|| Error::NotFound(format!("User {}", user_id)))?;

    let user = row_to_user(&row)?;
    if user.is_deleted {
        return Err(Error::Deleted(format!("User {}", user_id)));
    }
    Ok(user)
}

fn row_to_user(row: &PgRow) -> Result<UserRecord> {
    Ok(UserRecord {
        user_id: column(row, "user_id")?,
        email: column(row, "email")?,
        display_name: column(row, "display_name")?,
        roles: column(row, "roles")?,
        is_active: column(row, "is_active")?,
        is_deleted: column(row, "is_deleted")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
        created_by: column(row, "created_by")?,
    })
}

#[async_trait]
impl UserStore for PostgresUserStore {
    async fn create_user(&self, space: &TenantSpace, user: NewUser) -> Result<UserRecord> {
        self.run("create", async {
            let NewUser {
                user_id,
                email,
                display_name,
                roles,
                created_by,
            } = user;
            let email = ident::normalize_email(&email)?;
            let roles = normalize_roles(roles)?;
            let display_name = normalize_display_name(display_name);
            let user_id = user_id.unwrap_or_else(Uuid::new_v4);

            let mut tx = self.begin(space).await?;
            let result: Result<UserRecord> = async {
                tx.lock_key(&format!("folio:user-email:{}:{}", space.schema_name, email))
                    .await?;
                ensure_email_free(&mut tx, &email, None).await?;

                let row = sqlx::query(&format!(
                    "INSERT INTO users (user_id, email, display_name, roles, created_by)
                     VALUES ($1, $2, $3, $4, $5)
                     RETURNING {}",
                    USER_COLUMNS
                ))
                .bind(user_id)
                .bind(&email)
                .bind(&display_name)
                .bind(&roles)
                .bind(&created_by)
                .fetch_one(tx.conn())
                .await
                .map_err(|e| insert_error("insert user", &format!("User {}", user_id), e))?;

                debug!("Created user {} in {}", user_id, space.schema_name);
                row_to_user(&row)
            }
            .await;
            self.complete(space, tx, result).await
        })
        .await
    }

    async fn get_user(&self, space: &TenantSpace, user_id: Uuid) -> Result<UserRecord> {
        self.run("get", async {
            let mut tx = self.begin(space).await?;
            let result = fetch_user(&mut tx, user_id, false).await;
            self.complete(space, tx, result).await
        })
        .await
    }

    async fn get_user_by_email(&self, space: &TenantSpace, email: &str) -> Result<UserRecord> {
        self.run("get_by_email", async {
            let email = ident::normalize_email(email)?;
            let mut tx = self.begin(space).await?;
            let result: Result<UserRecord> = async {
                let row = sqlx::query(&format!(
                    "SELECT {} FROM users WHERE lower(email) = $1 AND NOT is_deleted",
                    USER_COLUMNS
                ))
                .bind(&email)
                .fetch_optional(tx.conn())
                .await
                .map_err(|e| db_error("load user by email", e))?
                .ok_or_else(|| Error::NotFound(format!("User with email {}", email)))?;
                row_to_user(&row)
            }
            .await;
            self.complete(space, tx, result).await
        })
        .await
    }

    async fn list_users(&self, space: &TenantSpace, query: &UserQuery) -> Result<Vec<UserRecord>> {
        self.run("list", async {
            let mut tx = self.begin(space).await?;
            let result: Result<Vec<UserRecord>> = async {
                let rows = sqlx::query(&format!(
                    "SELECT {} FROM users
                     WHERE $1 OR NOT is_deleted
                     ORDER BY email, user_id
                     LIMIT $2 OFFSET $3",
                    USER_COLUMNS
                ))
                .bind(query.include_deleted)
                .bind(i64::from(query.limit.clamp(1, MAX_LIST_LIMIT)))
                .bind(i64::from(query.offset))
                .fetch_all(tx.conn())
                .await
                .map_err(|e| db_error("list users", e))?;

                rows.iter().map(row_to_user).collect::<Result<Vec<_>>>()
            }
            .await;
            self.complete(space, tx, result).await
        })
        .await
    }

    async fn update_user(
        &self,
        space: &TenantSpace,
        user_id: Uuid,
        update: UserUpdate,
    ) -> Result<UserRecord> {
        self.run("update", async {
            let UserUpdate {
                email,
                display_name,
                roles,
                is_active,
            } = update;
            let email = email.as_deref().map(ident::normalize_email).transpose()?;
            let roles = roles.map(normalize_roles).transpose()?;

            let mut tx = self.begin(space).await?;
            let result: Result<UserRecord> = async {
                if let Some(email) = &email {
                    tx.lock_key(&format!("folio:user-email:{}:{}", space.schema_name, email))
                        .await?;
                }
                let current = fetch_user(&mut tx, user_id, true).await?;
                if let Some(email) = &email {
                    ensure_email_free(&mut tx, email, Some(user_id)).await?;
                }

                let display_name = match display_name {
                    Some(name) => normalize_display_name(Some(name)),
                    None => current.display_name,
                };

                let row = sqlx::query(&format!(
                    "UPDATE users
                     SET email = $2, display_name = $3, roles = $4, is_active = $5,
                         updated_at = NOW()
                     WHERE user_id = $1
                     RETURNING {}",
                    USER_COLUMNS
                ))
                .bind(user_id)
                .bind(email.unwrap_or(current.email))
                .bind(display_name)
                .bind(roles.unwrap_or(current.roles))
                .bind(is_active.unwrap_or(current.is_active))
                .fetch_one(tx.conn())
                .await
                .map_err(|e| db_error("update user", e))?;

                row_to_user(&row)
            }
            .await;
            self.complete(space, tx, result).await
        })
        .await
    }

    async fn delete_user(&self, space: &TenantSpace, user_id: Uuid) -> Result<()> {
        self.run("delete", async {
            let mut tx = self.begin(space).await?;
            let result: Result<()> = async {
                let deleted = sqlx::query(
                    "UPDATE users SET is_deleted = TRUE, is_active = FALSE, updated_at = NOW()
                     WHERE user_id = $1 AND NOT is_deleted",
                )
                .bind(user_id)
                .execute(tx.conn())
                .await
                .map_err(|e| db_error("delete user", e))?;

                if deleted.rows_affected() == 0 {
                    return Err(Error::NotFound(format!("User {}", user_id)));
                }
                debug!("Deleted user {} in {}", user_id, space.schema_name);
                Ok(())
            }
            .await;
            self.complete(space, tx, result).await
        })
        .await
    }
}
