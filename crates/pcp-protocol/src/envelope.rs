use serde::{Deserialize, Serialize};
use serde_json::Value;

/// v1 wire envelope. Required properties per the registered envelope
/// schema: `id`, `message_type`, `expires`, `targets`, `sender`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeV1 {
    pub id: String,
    pub message_type: String,
    /// ISO-8601 UTC instant with a trailing `Z`.
    pub expires: String,
    pub targets: Vec<String>,
    pub sender: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub destination_report: Option<bool>,
}

/// v2 wire envelope: the entire wire frame is this one JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeV2 {
    pub id: String,
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub in_reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
}

/// The content type a registered schema declares for its data chunk, used
/// by the codec to decide how to interpret the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Binary,
}

/// A data chunk's decoded content, tagged by how the registered schema said
/// to interpret it.
#[derive(Debug, Clone, PartialEq)]
pub enum DataContent {
    Json(Value),
    Binary(Vec<u8>),
}

/// The result of parsing one wire frame (either version), independent of
/// which codec produced it.
///
/// `envelope` is kept as a generic JSON object rather than `EnvelopeV1`
/// specifically: v2 frames fold target/sender/in_reply_to/data into the same
/// shape, and downstream dispatch (`Connector::process_message`) only ever
/// needs `message_type`, `id`, and `sender` off of it.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub envelope: Value,
    pub has_data: bool,
    pub invalid_data: bool,
    pub data: Option<DataContent>,
    pub debug: Vec<Value>,
    pub num_invalid_debug: u32,
}

impl ParsedMessage {
    pub fn message_type(&self) -> Option<&str> {
        self.envelope.get("message_type")?.as_str()
    }

    pub fn id(&self) -> Option<&str> {
        self.envelope.get("id")?.as_str()
    }

    pub fn sender(&self) -> Option<&str> {
        self.envelope.get("sender")?.as_str()
    }

    /// The data chunk's content as JSON, regardless of whether the schema
    /// declared it `Json` or it was `invalid_data` and never typed.
    pub fn data_as_json(&self) -> Option<&Value> {
        match &self.data {
            Some(DataContent::Json(v)) => Some(v),
            _ => None,
        }
    }
}
