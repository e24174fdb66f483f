//! v2 wire frame: a single JSON object envelope, carrying its own `data`
//! field inline rather than as a separate chunk.

use serde_json::Value;

use crate::error::{PcpError, Result};

/// Parses a v2 frame (a UTF-8 JSON object) into its raw `Value`.
///
/// Structural validation (the `id`/`message_type` required-field check) is
/// performed by the caller via [`crate::schema`]'s envelope schema so both
/// wire versions share one `Validation` failure path.
pub fn parse_frame(bytes: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| PcpError::MessageSerialization(format!("frame is not valid UTF-8: {e}")))?;
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(PcpError::MessageSerialization(
            "v2 frame must be a JSON object".into(),
        ));
    }
    Ok(value)
}

/// Serializes a v2 envelope `Value` to its wire bytes.
pub fn serialize_frame(envelope: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_object() {
        let bytes = br#"{"id":"a","message_type":"custom/ping"}"#;
        let value = parse_frame(bytes).unwrap();
        assert_eq!(value["id"], "a");
    }

    #[test]
    fn rejects_non_object_json() {
        let err = parse_frame(b"[1,2,3]").unwrap_err();
        assert!(matches!(err, PcpError::MessageSerialization(_)));
    }

    #[test]
    fn rejects_invalid_utf8() {
        let err = parse_frame(&[0xFF, 0xFE, 0xFD]).unwrap_err();
        assert!(matches!(err, PcpError::MessageSerialization(_)));
    }

    #[test]
    fn round_trips_full_envelope() {
        let value = serde_json::json!({
            "id": "r1",
            "message_type": "custom/ping",
            "target": "pcp://a/b",
            "sender": "pcp://c/d",
            "in_reply_to": "r0",
            "data": {"k": "v"},
        });
        let bytes = serialize_frame(&value).unwrap();
        let parsed = parse_frame(&bytes).unwrap();
        assert_eq!(parsed, value);
    }
}
