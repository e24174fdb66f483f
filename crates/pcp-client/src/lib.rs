//! Resilient client for the Puppet Communications Protocol (PCP).
//!
//! Provides certificate-derived client identity, TLS connection setup, a
//! reconnecting/failing-over WebSocket [`Connection`], v1 Session
//! Association, message-type dispatch via [`Connector`], and a background
//! Monitor Task that keeps the connection alive and reconnects it.

mod association;
mod connection;
mod connector;
mod identity;
mod pumps;
mod tls;
mod types;

pub use connector::{Connector, Handler, OutboundMessage, Protocol};
pub use identity::{ClientIdentity, ConnectionTimeouts};
pub use types::{AssociationTimings, BrokerList, ConnectionState, ConnectionTimings, ReconnectConfig};

pub use pcp_protocol::envelope::{ContentType, DataContent, ParsedMessage};
pub use pcp_protocol::error::{PcpError, Result};
