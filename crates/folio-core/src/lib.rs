//! Folio Core Types and Traits
//!
//! This crate provides the fundamental types and traits used throughout Folio:
//! - Tenant spaces and the tenant registry contract
//! - Schema, entity, user and category records and their store traits
//! - Identifier normalization, content hashing and semantic versions
//! - JSON-Schema validation with a per-instance compiled cache
//! - Core error types

pub mod category;
pub mod entity_store;
pub mod error;
pub mod hash;
pub mod ident;
pub mod schema_store;
pub mod tenant;
pub mod user_store;
pub mod validator;
pub mod version;

pub use category::{CategoryRecord, CategoryStore, NewCategory};
pub use entity_store::{
    EntityQuery, EntityRecord, EntityStore, EntityWrite, SortField, SortOrder,
};
pub use error::{Error, ErrorKind, FieldViolation, Result};
pub use schema_store::{SchemaListQuery, SchemaRecord, SchemaStore, SchemaWrite};
pub use tenant::{
    NewTenant, TenantChange, TenantId, TenantRecord, TenantSpace, TenantStatus, TenantStore,
};
pub use user_store::{NewUser, UserQuery, UserRecord, UserStore, UserUpdate};
pub use validator::SchemaValidator;
pub use version::Version;
