//! Identifier, table name and slug normalization
//!
//! Everything that ends up inside dynamically built SQL (table names, schema
//! names, role names) must pass one of these patterns first and is then quoted
//! with [`quote_ident`].

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::{Error, Result};

/// Maximum entity identifier length
pub const MAX_ENTITY_ID_LEN: usize = 128;

/// Entity identifiers: 1-128 chars of `[A-Za-z0-9._:-]`
static ENTITY_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._:\-]{1,128}$").unwrap());

/// Entity table names. Capped at 48 chars so derived index names stay below
/// the 63 byte PostgreSQL identifier limit.
static TABLE_NAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,47}$").unwrap());

/// Database schema and role names
static DB_NAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").unwrap());

/// Kebab-case slugs
static SLUG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").unwrap());

static EMAIL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

/// Maximum slug length
pub const MAX_SLUG_LEN: usize = 64;

/// Table names owned by the admin schema. Entity families may not shadow them.
const RESERVED_TABLE_NAMES: &[&str] = &[
    "categories",
    "schema_repository",
    "schema_migrations",
    "tenants",
    "users",
];

/// Normalize a caller supplied entity id, generating a UUID when absent or blank.
pub fn normalize_entity_id(entity_id: Option<&str>) -> Result<String> {
    match entity_id.map(str::trim) {
        None | Some("") => Ok(Uuid::new_v4().to_string()),
        Some(id) => validate_entity_id(id).map(|()| id.to_string()),
    }
}

/// Validate an entity id without generating one.
pub fn validate_entity_id(entity_id: &str) -> Result<()> {
    if ENTITY_ID_REGEX.is_match(entity_id) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Invalid entity id '{}': expected 1-{} characters from [A-Za-z0-9._:-]",
            entity_id, MAX_ENTITY_ID_LEN
        )))
    }
}

/// Normalize and validate an entity table name (lowercased, trimmed).
pub fn normalize_table_name(table_name: &str) -> Result<String> {
    let normalized = table_name.trim().to_ascii_lowercase();
    if !TABLE_NAME_REGEX.is_match(&normalized) {
        return Err(Error::Validation(format!(
            "Invalid table name '{}': expected a lowercase identifier of at most 48 characters",
            table_name
        )));
    }
    if RESERVED_TABLE_NAMES.contains(&normalized.as_str()) {
        return Err(Error::Validation(format!(
            "Table name '{}' is reserved",
            normalized
        )));
    }
    Ok(normalized)
}

/// Normalize and validate a slug (lowercased, trimmed, kebab-case).
pub fn normalize_slug(slug: &str) -> Result<String> {
    let normalized = slug.trim().to_ascii_lowercase();
    if normalized.len() > MAX_SLUG_LEN || !SLUG_REGEX.is_match(&normalized) {
        return Err(Error::Validation(format!(
            "Invalid slug '{}': expected kebab-case of at most {} characters",
            slug, MAX_SLUG_LEN
        )));
    }
    Ok(normalized)
}

/// Validate a database schema or role name.
pub fn validate_db_name(kind: &str, name: &str) -> Result<()> {
    if DB_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "Invalid {} '{}': expected a lowercase identifier",
            kind, name
        )))
    }
}

/// Normalize an email address for storage and lookup.
pub fn normalize_email(email: &str) -> Result<String> {
    let normalized = email.trim().to_ascii_lowercase();
    if EMAIL_REGEX.is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(Error::Validation(format!("Invalid email address '{}'", email)))
    }
}

/// Quote an identifier for inclusion in SQL text.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_generated_when_blank() {
        let generated = normalize_entity_id(None).unwrap();
        assert!(Uuid::parse_str(&generated).is_ok());

        let generated = normalize_entity_id(Some("   ")).unwrap();
        assert!(Uuid::parse_str(&generated).is_ok());
    }

    #[test]
    fn test_entity_id_validation() {
        assert_eq!(
            normalize_entity_id(Some(" card:black-lotus.v1 ")).unwrap(),
            "card:black-lotus.v1"
        );
        assert!(normalize_entity_id(Some("has space")).is_err());
        assert!(normalize_entity_id(Some("semi;colon")).is_err());
        assert!(validate_entity_id(&"a".repeat(128)).is_ok());
        assert!(validate_entity_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_table_name_rules() {
        assert_eq!(normalize_table_name(" Cards ").unwrap(), "cards");
        assert_eq!(normalize_table_name("mtg_cards_2").unwrap(), "mtg_cards_2");
        assert!(normalize_table_name("2cards").is_err());
        assert!(normalize_table_name("cards; drop table x").is_err());
        assert!(normalize_table_name("tenants").is_err());
        assert!(normalize_table_name(&"a".repeat(49)).is_err());
    }

    #[test]
    fn test_slug_rules() {
        assert_eq!(normalize_slug("Magic-Cards").unwrap(), "magic-cards");
        assert!(normalize_slug("magic--cards").is_err());
        assert!(normalize_slug("-magic").is_err());
        assert!(normalize_slug("magic_cards").is_err());
        assert!(normalize_slug(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_email_normalization() {
        assert_eq!(
            normalize_email(" Ada@Example.COM ").unwrap(),
            "ada@example.com"
        );
        assert!(normalize_email("not-an-email").is_err());
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("cards"), "\"cards\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_db_name_rules() {
        assert!(validate_db_name("schema", "tenant_1a2b3c4d").is_ok());
        assert!(validate_db_name("role", "Tenant").is_err());
        assert!(validate_db_name("role", "").is_err());
    }
}
