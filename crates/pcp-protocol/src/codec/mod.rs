//! Message codec (§4.2): v1 binary-chunked frames and v2 JSON envelopes,
//! both parsing to and serializing from the shared [`ParsedMessage`] shape.

pub mod v1;
pub mod v2;

use serde_json::Value;

use crate::envelope::{ContentType, DataContent, ParsedMessage};
use crate::error::{PcpError, Result};
use crate::schema::SchemaRegistry;

fn require_fields(envelope: &Value, fields: &[&str]) -> Result<()> {
    let obj = envelope
        .as_object()
        .ok_or_else(|| PcpError::Validation {
            schema: "envelope_schema".into(),
            detail: "envelope is not a JSON object".into(),
        })?;
    for field in fields {
        if !obj.contains_key(*field) {
            return Err(PcpError::Validation {
                schema: "envelope_schema".into(),
                detail: format!("missing required property `{field}`"),
            });
        }
    }
    Ok(())
}

/// Resolves a data chunk's bytes against the schema registered under
/// `message_type`. Never fails the overall parse: an unknown schema or a
/// validation failure sets `invalid_data` instead, per §4.2.
fn resolve_data(message_type: &str, content: &[u8], registry: &SchemaRegistry) -> (bool, DataContent) {
    match registry.content_type_of(message_type) {
        Ok(ContentType::Binary) => (false, DataContent::Binary(content.to_vec())),
        Ok(ContentType::Json) => match serde_json::from_slice::<Value>(content) {
            Ok(value) => match registry.validate(&value, message_type) {
                Ok(()) => (false, DataContent::Json(value)),
                Err(_) => (true, DataContent::Json(value)),
            },
            Err(_) => (true, DataContent::Binary(content.to_vec())),
        },
        Err(_) => (true, DataContent::Binary(content.to_vec())),
    }
}

/// Parses a v1 binary-chunked frame into a [`ParsedMessage`].
pub fn parse_v1(bytes: &[u8], registry: &SchemaRegistry) -> Result<ParsedMessage> {
    let raw = v1::parse_frame(bytes)?;
    let envelope: Value = serde_json::from_slice(&raw.envelope)
        .map_err(|e| PcpError::MessageSerialization(format!("envelope is not valid JSON: {e}")))?;
    require_fields(&envelope, &["id", "message_type", "expires", "targets", "sender"])?;
    let message_type = envelope["message_type"]
        .as_str()
        .expect("checked present by require_fields")
        .to_string();

    let (invalid_data, data) = match &raw.data {
        Some(chunk) => {
            let (invalid, content) = resolve_data(&message_type, &chunk.content, registry);
            (invalid, Some(content))
        }
        None => (false, None),
    };

    let mut debug = Vec::new();
    let mut num_invalid_debug = 0u32;
    for item in &raw.debug {
        match serde_json::from_slice::<Value>(item) {
            Ok(value) => match registry.validate(&value, crate::constants::DEBUG_ITEM_SCHEMA_NAME) {
                Ok(()) => debug.push(value),
                Err(_) => num_invalid_debug += 1,
            },
            Err(_) => num_invalid_debug += 1,
        }
    }

    Ok(ParsedMessage {
        has_data: raw.data.is_some(),
        invalid_data,
        envelope,
        data,
        debug,
        num_invalid_debug,
    })
}

/// Parses a v2 JSON-envelope frame into a [`ParsedMessage`]. v2 has no
/// separate debug-chunk concept; `debug` is always empty.
pub fn parse_v2(bytes: &[u8], registry: &SchemaRegistry) -> Result<ParsedMessage> {
    let envelope = v2::parse_frame(bytes)?;
    require_fields(&envelope, &["id", "message_type"])?;
    let message_type = envelope["message_type"]
        .as_str()
        .expect("checked present by require_fields")
        .to_string();

    let (invalid_data, data) = match envelope.get("data").filter(|d| !d.is_null()) {
        Some(value) => match registry.validate(value, &message_type) {
            Ok(()) => (false, Some(DataContent::Json(value.clone()))),
            Err(_) => (true, Some(DataContent::Json(value.clone()))),
        },
        None => (false, None),
    };

    Ok(ParsedMessage {
        has_data: data.is_some(),
        invalid_data,
        envelope,
        data,
        debug: Vec::new(),
        num_invalid_debug: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ContentType;
    use crate::schema::Schema;

    fn registry_with(message_type: &str, document: Value) -> SchemaRegistry {
        let registry = SchemaRegistry::new();
        registry
            .register(Schema::compile(message_type, ContentType::Json, &document).unwrap())
            .unwrap();
        registry
            .register(
                Schema::compile(
                    crate::constants::DEBUG_ITEM_SCHEMA_NAME,
                    ContentType::Json,
                    &crate::schema::debug_item_schema_document(),
                )
                .unwrap(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn v1_missing_id_is_validation_error() {
        let registry = SchemaRegistry::new();
        let envelope = br#"{"message_type":"x","expires":"2026-01-01T00:00:00Z","targets":[],"sender":"pcp://a/b"}"#;
        let bytes = v1::serialize_frame(envelope, None, &[]);
        let err = parse_v1(&bytes, &registry).unwrap_err();
        assert!(matches!(err, PcpError::Validation { .. }));
    }

    #[test]
    fn v1_unknown_message_type_sets_invalid_data_but_still_delivers() {
        let registry = SchemaRegistry::new();
        let envelope = br#"{"id":"a","message_type":"custom/unregistered","expires":"2026-01-01T00:00:00Z","targets":[],"sender":"pcp://a/b"}"#;
        let bytes = v1::serialize_frame(envelope, Some((crate::constants::chunk_descriptor::DATA, b"{\"x\":1}")), &[]);
        let parsed = parse_v1(&bytes, &registry).unwrap();
        assert!(parsed.invalid_data);
        assert!(parsed.has_data);
    }

    #[test]
    fn v1_valid_data_chunk_validates_clean() {
        let registry = registry_with(
            "custom/typed",
            serde_json::json!({"type": "object", "required": ["n"]}),
        );
        let envelope = br#"{"id":"a","message_type":"custom/typed","expires":"2026-01-01T00:00:00Z","targets":[],"sender":"pcp://a/b"}"#;
        let bytes = v1::serialize_frame(
            envelope,
            Some((crate::constants::chunk_descriptor::DATA, br#"{"n":1}"#)),
            &[],
        );
        let parsed = parse_v1(&bytes, &registry).unwrap();
        assert!(!parsed.invalid_data);
        assert_eq!(parsed.data_as_json().unwrap()["n"], 1);
    }

    #[test]
    fn v1_invalid_debug_chunk_increments_counter_without_failing_parse() {
        let registry = registry_with("custom/typed", serde_json::json!(true));
        let envelope = br#"{"id":"a","message_type":"custom/typed","expires":"2026-01-01T00:00:00Z","targets":[],"sender":"pcp://a/b"}"#;
        let debug = vec![b"not json".to_vec(), br#"{"hop":"a"}"#.to_vec()];
        let bytes = v1::serialize_frame(envelope, None, &debug);
        let parsed = parse_v1(&bytes, &registry).unwrap();
        assert_eq!(parsed.num_invalid_debug, 1);
        assert_eq!(parsed.debug.len(), 1);
    }

    #[test]
    fn v2_missing_message_type_is_validation_error() {
        let registry = SchemaRegistry::new();
        let bytes = br#"{"id":"a"}"#;
        let err = parse_v2(bytes, &registry).unwrap_err();
        assert!(matches!(err, PcpError::Validation { .. }));
    }

    #[test]
    fn v2_without_data_parses_cleanly() {
        let registry = SchemaRegistry::new();
        let bytes = br#"{"id":"a","message_type":"custom/ping"}"#;
        let parsed = parse_v2(bytes, &registry).unwrap();
        assert!(!parsed.has_data);
        assert!(!parsed.invalid_data);
    }
}
