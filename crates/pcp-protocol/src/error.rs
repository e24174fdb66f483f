use thiserror::Error;

/// The full PCP error taxonomy, shared between the wire-format layer and the
/// connection/connector layer built on top of it.
///
/// Kept as a single flat enum rather than a class hierarchy: callers match on
/// `PcpError` variants directly instead of downcasting a trait object.
#[derive(Debug, Error)]
pub enum PcpError {
    /// Construction-time misconfiguration: bad certs, unreachable TLS init,
    /// an invalid timing combination for monitoring.
    #[error("connection configuration error: {0}")]
    ConnectionConfig(String),

    /// Reconnect attempts exhausted.
    #[error("connection fatal error: {0}")]
    ConnectionFatal(String),

    /// Transient underlying WebSocket send/close/ping failure.
    #[error("connection processing error: {0}")]
    ConnectionProcessing(String),

    /// An API was called before `connect`.
    #[error("connection not initialized")]
    ConnectionNotInit,

    /// Timeout, invalid message, or correlated error/ttl_expired/version_error
    /// during Session Association.
    #[error("association error: {0}")]
    AssociationError(String),

    /// The broker responded to an associate_request with `success: false`.
    #[error("association response failure: {0}")]
    AssociationResponseFailure(String),

    /// The v1 wire frame could not be parsed into chunks, or the envelope
    /// JSON failed to decode.
    #[error("message serialization error: {0}")]
    MessageSerialization(String),

    /// The v1 frame's version byte names a version this client doesn't
    /// support.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// A chunk's declared size or descriptor made the frame unparseable in a
    /// way distinct from a general serialization failure (used by the codec
    /// internally; surfaced to callers as `MessageSerialization`).
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    /// `SchemaRegistry::register` called with a name that already exists.
    #[error("schema already registered: {0}")]
    SchemaRedefinition(String),

    /// `SchemaRegistry::validate` or `content_type_of` called with an unknown
    /// schema name.
    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    /// A document failed JSON Schema validation.
    #[error("validation failed for schema {schema}: {detail}")]
    Validation { schema: String, detail: String },
}

impl From<serde_json::Error> for PcpError {
    fn from(err: serde_json::Error) -> Self {
        PcpError::MessageSerialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PcpError>;
