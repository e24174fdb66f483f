//! Schema registry and JSON Schema validation (§4.3).
//!
//! The registry is a `name -> Schema` map behind a `RwLock`: concurrent
//! validation is allowed, registration takes the exclusive side. Once a
//! name is registered it is immutable — `register` never overwrites.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::envelope::ContentType;
use crate::error::{PcpError, Result};

/// A compiled schema bound to a content type. `content_type` tells the codec
/// whether the data chunk registered under this name should be parsed as
/// JSON or handed back as raw bytes.
pub struct Schema {
    name: String,
    content_type: ContentType,
    validator: jsonschema::Validator,
}

impl Schema {
    /// Compiles a JSON Schema document. Fails with `ConnectionConfig` if the
    /// document itself is not a valid schema — this only happens for
    /// caller-supplied schemas; the built-in PCP schemas are covered by
    /// tests below.
    pub fn compile(name: impl Into<String>, content_type: ContentType, document: &Value) -> Result<Self> {
        let validator = jsonschema::validator_for(document)
            .map_err(|e| PcpError::ConnectionConfig(format!("invalid schema document: {e}")))?;
        Ok(Self {
            name: name.into(),
            content_type,
            validator,
        })
    }

    /// A schema with no constraints beyond "is a JSON value" — used for
    /// content types where the registry only needs to track the content
    /// type, not enforce shape (e.g. `Binary` data chunks).
    pub fn any(name: impl Into<String>, content_type: ContentType) -> Self {
        Self::compile(name, content_type, &serde_json::json!(true))
            .expect("`true` is always a valid JSON Schema document")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }
}

/// Thread-safe `name -> Schema` map. Validation proceeds under a shared
/// read lock; `register` takes the exclusive lock only for the insert.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with `SchemaRedefinition` if `schema.name()` is already
    /// registered.
    pub fn register(&self, schema: Schema) -> Result<()> {
        let mut map = self.schemas.write().expect("schema registry lock poisoned");
        if map.contains_key(&schema.name) {
            return Err(PcpError::SchemaRedefinition(schema.name));
        }
        map.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    /// Fails with `SchemaNotFound` if `schema_name` was never registered,
    /// `Validation` if `document` does not satisfy the schema.
    pub fn validate(&self, document: &Value, schema_name: &str) -> Result<()> {
        let schema = self.get(schema_name)?;
        schema
            .validator
            .validate(document)
            .map_err(|e| PcpError::Validation {
                schema: schema_name.to_string(),
                detail: e.to_string(),
            })
    }

    /// Fails with `SchemaNotFound` if `schema_name` was never registered.
    pub fn content_type_of(&self, schema_name: &str) -> Result<ContentType> {
        Ok(self.get(schema_name)?.content_type())
    }

    pub fn contains(&self, schema_name: &str) -> bool {
        self.schemas
            .read()
            .expect("schema registry lock poisoned")
            .contains_key(schema_name)
    }

    fn get(&self, schema_name: &str) -> Result<Arc<Schema>> {
        self.schemas
            .read()
            .expect("schema registry lock poisoned")
            .get(schema_name)
            .cloned()
            .ok_or_else(|| PcpError::SchemaNotFound(schema_name.to_string()))
    }
}

/// Builds the JSON Schema document for the v1 envelope (§4.2): `id`,
/// `message_type`, `expires`, `targets`, `sender` required; `destination_report`
/// optional.
pub fn envelope_schema_document() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "id": { "type": "string" },
            "message_type": { "type": "string" },
            "expires": { "type": "string" },
            "targets": { "type": "array", "items": { "type": "string" } },
            "sender": { "type": "string" },
            "destination_report": { "type": "boolean" }
        },
        "required": ["id", "message_type", "expires", "targets", "sender"]
    })
}

/// Debug chunk item schema: a free-form hop record.
pub fn debug_item_schema_document() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "hop": { "type": "string" },
            "time": { "type": "string" }
        },
        "required": ["hop"]
    })
}

/// Debug chunk schema: an array of debug items.
pub fn debug_schema_document() -> Value {
    serde_json::json!({
        "type": "array"
    })
}

pub fn associate_response_schema_document() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "id": { "type": "string" },
            "success": { "type": "boolean" },
            "reason": { "type": "string" }
        },
        "required": ["id", "success"]
    })
}

pub fn error_message_schema_document() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "id": { "type": "string" },
            "description": { "type": "string" }
        },
        "required": ["id", "description"]
    })
}

pub fn ttl_expired_schema_document() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "id": { "type": "string" }
        },
        "required": ["id"]
    })
}

pub fn version_error_schema_document() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "id": { "type": "string" },
            "target_identity": { "type": "string" }
        },
        "required": ["id"]
    })
}

pub fn destination_report_schema_document() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "id": { "type": "string" },
            "targets": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["id", "targets"]
    })
}

pub fn inventory_request_schema_document() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "query": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["query"]
    })
}

pub fn inventory_response_schema_document() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "uris": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["uris"]
    })
}

/// Registers the structural envelope/debug schemas and every core PCP
/// message-type schema the Connector dispatches on. Called once by
/// `Connector::new`; subsequent calls to `register_callback` for other
/// schema names share the same registry.
pub fn register_core_schemas(registry: &SchemaRegistry) -> Result<()> {
    use crate::constants::*;

    registry.register(Schema::compile(
        ENVELOPE_SCHEMA_NAME,
        ContentType::Json,
        &envelope_schema_document(),
    )?)?;
    registry.register(Schema::compile(
        DEBUG_SCHEMA_NAME,
        ContentType::Json,
        &debug_schema_document(),
    )?)?;
    registry.register(Schema::compile(
        DEBUG_ITEM_SCHEMA_NAME,
        ContentType::Json,
        &debug_item_schema_document(),
    )?)?;
    registry.register(Schema::compile(
        ASSOCIATE_RESP_TYPE,
        ContentType::Json,
        &associate_response_schema_document(),
    )?)?;
    registry.register(Schema::compile(
        ERROR_MSG_TYPE,
        ContentType::Json,
        &error_message_schema_document(),
    )?)?;
    registry.register(Schema::compile(
        TTL_EXPIRED_TYPE,
        ContentType::Json,
        &ttl_expired_schema_document(),
    )?)?;
    registry.register(Schema::compile(
        VERSION_ERROR_TYPE,
        ContentType::Json,
        &version_error_schema_document(),
    )?)?;
    registry.register(Schema::compile(
        DESTINATION_REPORT_TYPE,
        ContentType::Json,
        &destination_report_schema_document(),
    )?)?;
    registry.register(Schema::compile(
        INVENTORY_REQ_TYPE,
        ContentType::Json,
        &inventory_request_schema_document(),
    )?)?;
    registry.register(Schema::compile(
        INVENTORY_RESP_TYPE,
        ContentType::Json,
        &inventory_response_schema_document(),
    )?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_redefine_fails() {
        let registry = SchemaRegistry::new();
        let schema = Schema::any("dup", ContentType::Json);
        registry.register(schema).unwrap();
        let err = registry
            .register(Schema::any("dup", ContentType::Json))
            .unwrap_err();
        assert!(matches!(err, PcpError::SchemaRedefinition(name) if name == "dup"));
    }

    #[test]
    fn validate_unknown_schema_fails() {
        let registry = SchemaRegistry::new();
        let err = registry
            .validate(&serde_json::json!({}), "nope")
            .unwrap_err();
        assert!(matches!(err, PcpError::SchemaNotFound(name) if name == "nope"));
    }

    #[test]
    fn validate_rejects_non_conforming_document() {
        let registry = SchemaRegistry::new();
        registry
            .register(
                Schema::compile("needs_id", ContentType::Json, &serde_json::json!({
                    "type": "object",
                    "required": ["id"]
                }))
                .unwrap(),
            )
            .unwrap();
        let err = registry
            .validate(&serde_json::json!({"not_id": 1}), "needs_id")
            .unwrap_err();
        assert!(matches!(err, PcpError::Validation { .. }));
        registry
            .validate(&serde_json::json!({"id": "x"}), "needs_id")
            .unwrap();
    }

    #[test]
    fn core_schemas_register_without_conflict() {
        let registry = SchemaRegistry::new();
        register_core_schemas(&registry).unwrap();
        assert!(registry.contains(crate::constants::ENVELOPE_SCHEMA_NAME));
        assert!(registry.contains(crate::constants::ASSOCIATE_RESP_TYPE));
        assert_eq!(
            registry
                .content_type_of(crate::constants::ERROR_MSG_TYPE)
                .unwrap(),
            ContentType::Json
        );
    }

    #[test]
    fn envelope_schema_validates_required_fields() {
        let registry = SchemaRegistry::new();
        registry
            .register(
                Schema::compile(
                    crate::constants::ENVELOPE_SCHEMA_NAME,
                    ContentType::Json,
                    &envelope_schema_document(),
                )
                .unwrap(),
            )
            .unwrap();
        let missing_id = serde_json::json!({
            "message_type": "x",
            "expires": "2026-01-01T00:00:00Z",
            "targets": [],
            "sender": "pcp://a/b"
        });
        let err = registry
            .validate(&missing_id, crate::constants::ENVELOPE_SCHEMA_NAME)
            .unwrap_err();
        assert!(matches!(err, PcpError::Validation { .. }));
    }
}
