//! Error types for Folio Core

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Payload does not match schema {schema_id}@{schema_version}: {}", format_violations(.violations))]
    SchemaViolation {
        schema_id: String,
        schema_version: String,
        violations: Vec<FieldViolation>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Deleted: {0}")]
    Deleted(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // Multi-tenancy errors
    #[error("Tenant required: {0}")]
    TenantRequired(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification handed to calling layers for transport mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    PermissionDenied,
    Internal,
}

impl Error {
    /// Classify this error into the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) | Error::Deleted(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) | Error::Conflict(_) => ErrorKind::Conflict,
            Error::Validation(_) | Error::SchemaViolation { .. } | Error::TenantRequired(_) => {
                ErrorKind::Validation
            }
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::Serialization(_) | Error::Database(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

/// One failing JSON-Schema constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// JSON pointer into the payload (`""` for the document root)
    pub path: String,
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "/: {}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
