//! JSON-Schema validation with a compiled-validator cache
//!
//! A `(schema_id, schema_version)` pair never changes once written, so
//! compiled validators are kept for the lifetime of the instance. The cache
//! lives on the instance (not in a global) so independent stores can coexist.

use jsonschema::Validator;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::{Error, FieldViolation, Result, schema_store::SchemaRecord, version::Version};

type CacheKey = (Uuid, Version);

/// Validates payloads against schema versions
#[derive(Default)]
pub struct SchemaValidator {
    compiled: RwLock<HashMap<CacheKey, Arc<Validator>>>,
}

impl SchemaValidator {
    /// Create a validator with an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that `definition` is a compilable JSON Schema document.
    ///
    /// # Errors
    /// - `Error::Validation` if the definition is not an object or does not compile
    pub fn check_definition(definition: &Value) -> Result<()> {
        compile(definition).map(|_| ())
    }

    /// Validate a parsed payload against one schema version.
    ///
    /// # Errors
    /// - `Error::Validation` if the schema itself cannot be compiled
    /// - `Error::SchemaViolation` listing every failing constraint
    pub fn validate(&self, schema: &SchemaRecord, payload: &Value) -> Result<()> {
        let validator = self.compiled_for(schema)?;

        let violations: Vec<FieldViolation> = validator
            .iter_errors(payload)
            .map(|err| FieldViolation {
                path: err.instance_path.to_string(),
                message: err.to_string(),
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::SchemaViolation {
                schema_id: schema.schema_id.to_string(),
                schema_version: schema.schema_version.to_string(),
                violations,
            })
        }
    }

    /// Parse raw bytes and validate them, returning the parsed payload.
    ///
    /// # Errors
    /// - `Error::Validation` if the bytes are not valid UTF-8 JSON
    /// - `Error::SchemaViolation` as for [`validate`](Self::validate)
    pub fn validate_bytes(&self, schema: &SchemaRecord, payload: &[u8]) -> Result<Value> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| Error::Validation(format!("Payload is not valid JSON: {}", e)))?;
        self.validate(schema, &value)?;
        Ok(value)
    }

    /// Number of compiled validators held
    pub fn cached_len(&self) -> usize {
        self.compiled.read().len()
    }

    fn compiled_for(&self, schema: &SchemaRecord) -> Result<Arc<Validator>> {
        let key = (schema.schema_id, schema.schema_version);

        if let Some(validator) = self.compiled.read().get(&key) {
            return Ok(Arc::clone(validator));
        }

        let mut compiled = self.compiled.write();
        // Another task may have compiled it while we waited for the write lock
        if let Some(validator) = compiled.get(&key) {
            return Ok(Arc::clone(validator));
        }

        let validator = Arc::new(compile(&schema.schema_definition)?);
        compiled.insert(key, Arc::clone(&validator));
        debug!(
            "Compiled validator for schema {}@{}",
            schema.schema_id, schema.schema_version
        );
        Ok(validator)
    }
}

fn compile(definition: &Value) -> Result<Validator> {
    if !definition.is_object() {
        return Err(Error::Validation(
            "Schema definition must be a JSON object".to_string(),
        ));
    }
    jsonschema::validator_for(definition)
        .map_err(|e| Error::Validation(format!("Invalid JSON Schema: {}", e)))
}
