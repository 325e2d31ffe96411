//! Classification of sqlx errors into Folio errors, plus row decoding
//!
//! Stores wrap every database error with the operation that failed. Unique
//! violations become conflicts and privilege failures become
//! `PermissionDenied`; everything else stays a `Database` error.

use folio_core::{Error, Result, Version};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row};

/// SQLSTATE `unique_violation`
pub const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE `foreign_key_violation`
pub const FOREIGN_KEY_VIOLATION: &str = "23503";
/// SQLSTATE `insufficient_privilege`
pub const INSUFFICIENT_PRIVILEGE: &str = "42501";

/// Wrap a sqlx error with the operation that produced it.
pub fn db_error(operation: &str, err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::RowNotFound => Error::NotFound(operation.to_string()),
        sqlx::Error::Database(db) => {
            classify(db.code().as_deref(), db.message(), operation).unwrap_or_else(|| {
                Error::Database(format!("Failed to {}: {}", operation, err))
            })
        }
        _ => Error::Database(format!("Failed to {}: {}", operation, err)),
    }
}

/// Like [`db_error`], but a unique violation means the row already exists.
pub fn insert_error(operation: &str, what: &str, err: sqlx::Error) -> Error {
    match db_error(operation, err) {
        Error::Conflict(_) => Error::AlreadyExists(what.to_string()),
        other => other,
    }
}

/// Decode one column, naming it in the error.
pub fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| Error::Database(format!("Failed to decode column {}: {}", name, e)))
}

/// Decode a TEXT column holding a semantic version.
pub fn version_column(row: &PgRow, name: &str) -> Result<Version> {
    let raw: String = column(row, name)?;
    Version::parse(&raw)
        .map_err(|e| Error::Database(format!("Corrupt version in column {}: {}", name, e)))
}

fn classify(code: Option<&str>, message: &str, operation: &str) -> Option<Error> {
    match code? {
        UNIQUE_VIOLATION => Some(Error::Conflict(format!("{}: {}", operation, message))),
        FOREIGN_KEY_VIOLATION => Some(Error::Validation(format!(
            "{}: referenced row does not exist ({})",
            operation, message
        ))),
        INSUFFICIENT_PRIVILEGE => Some(Error::PermissionDenied(format!(
            "{}: {}",
            operation, message
        ))),
        _ => None,
    }
}
