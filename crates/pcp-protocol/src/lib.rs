//! Wire format, schema validation, and the shared error taxonomy for the
//! Puppet Communications Protocol (PCP).
//!
//! This crate has no networking concerns: it models a PCP message frame in
//! either wire version and validates decoded content against registered
//! schemas. The connection lifecycle, TLS, and Session Association live in
//! `pcp-client`, which depends on this crate.

pub mod codec;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod schema;

pub use envelope::{ContentType, DataContent, EnvelopeV1, EnvelopeV2, ParsedMessage};
pub use error::{PcpError, Result};
pub use schema::{register_core_schemas, Schema, SchemaRegistry};
