//! PCP message-type URIs, schema names, and wire-level constants.

/// Session Association request (v1 only; no data chunk).
pub const ASSOCIATE_REQ_TYPE: &str = "http://puppetlabs.com/associate_request";
/// Session Association response: `{ id, success, reason? }`.
pub const ASSOCIATE_RESP_TYPE: &str = "http://puppetlabs.com/associate_response";

/// Envelope error: data carries `{ id: cause_id, description }` (v1) or a
/// bare string (v2).
pub const ERROR_MSG_TYPE: &str = "http://puppetlabs.com/error_message";

/// Broker-originated: a targeted message was not delivered before its
/// `expires` deadline. Data carries `{ id: expired_msg_id }`.
pub const TTL_EXPIRED_TYPE: &str = "http://puppetlabs.com/ttl_expired";

pub const INVENTORY_REQ_TYPE: &str = "http://puppetlabs.com/inventory_request";
pub const INVENTORY_RESP_TYPE: &str = "http://puppetlabs.com/inventory_response";

/// Per-target delivery outcome, requested via the envelope's
/// `destination_report` flag.
pub const DESTINATION_REPORT_TYPE: &str = "http://puppetlabs.com/destination_report";

/// Broker response indicating the client's protocol version is unsupported.
/// Correlated the same way as `ttl_expired` during Session Association.
pub const VERSION_ERROR_TYPE: &str = "http://puppetlabs.com/version_error";

/// Registry names for the two structural (non-message-type) schemas every
/// v1 frame is validated against.
pub const ENVELOPE_SCHEMA_NAME: &str = "envelope_schema";
pub const DEBUG_SCHEMA_NAME: &str = "debug_schema";
pub const DEBUG_ITEM_SCHEMA_NAME: &str = "debug_item_schema";

/// Chunk descriptor type bits (low nibble of the descriptor byte).
pub mod chunk_descriptor {
    pub const ENVELOPE: u8 = 0x01;
    pub const DATA: u8 = 0x02;
    pub const DEBUG: u8 = 0x03;
    pub const TYPE_MASK: u8 = 0x0F;
}

/// `version (1 byte) + descriptor (1 byte) + size (4 bytes)`: the smallest
/// possible valid v1 frame is a version byte plus one empty envelope chunk
/// header.
pub const MIN_ENVELOPE_SIZE: usize = 6;
/// `descriptor (1 byte) + size (4 bytes)` preceding each chunk's content.
pub const CHUNK_METADATA_SIZE: usize = 5;
pub const VERSION_FIELD_SIZE: usize = 1;

pub const SUPPORTED_VERSIONS: &[u8] = &[1];

/// WebSocket close codes the connection layer cares about.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const ABNORMAL: u16 = 1006;
    pub const SUBPROTOCOL_ERROR: u16 = 3000;
}

/// Default backoff/association/monitor tunables (§4.1, §4.5, §4.6).
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 2000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 33_000;
pub const DEFAULT_BACKOFF_JITTER_MS: i64 = 500;
pub const DEFAULT_BACKOFF_MULTIPLIER_MIN: f64 = 1.5;
pub const DEFAULT_BACKOFF_MULTIPLIER_MAX: f64 = 2.5;

pub const DEFAULT_ASSOCIATION_TIMEOUT_S: u64 = 15;
pub const DEFAULT_CHECK_INTERVAL_S: u64 = 15;
pub const DEFAULT_WS_CONNECTION_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_WS_PONG_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_PONG_TIMEOUTS_BEFORE_RETRY: u32 = 3;

/// The Monitor Task sleeps this long before retrying a dropped connection,
/// to avoid a thundering retry against a flapping broker.
pub const MONITOR_RETRY_DELAY_MS: u64 = 200;

/// How long v1 `connect` waits for an already-open/connecting WebSocket to
/// close before starting a fresh Association attempt.
pub const ASSOCIATION_CLOSE_WAIT_S: u64 = 5;
