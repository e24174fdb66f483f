//! `Connector`: owns the `Connection`, the schema validator, and the
//! `message_type -> handler` table (§4.4). `V1`/`V2` is a protocol variant
//! dispatched on inside `process_message` rather than two subclasses (§9
//! design note: "express as a single Connector that takes a protocol
//! strategy as a variant").

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pcp_protocol::constants::{
    ASSOCIATE_REQ_TYPE, ASSOCIATE_RESP_TYPE, ERROR_MSG_TYPE, TTL_EXPIRED_TYPE, VERSION_ERROR_TYPE,
    chunk_descriptor,
};
use pcp_protocol::envelope::{ContentType, DataContent, EnvelopeV1, EnvelopeV2, ParsedMessage};
use pcp_protocol::error::{PcpError, Result};
use pcp_protocol::schema::{Schema, SchemaRegistry, register_core_schemas};

use crate::association::{Association, AssociationOutcome};
use crate::connection::{Connection, ConnectionEvent, WireKind};
use crate::identity::ClientIdentity;
use crate::types::{AssociationTimings, BrokerList, ConnectionState};

/// The wire-protocol variant a `Connector` speaks. v1 performs Session
/// Association on open; v2 conveys identity via the WebSocket path and
/// skips it entirely (§2 components 6/7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    V1,
    V2,
}

/// A registered message handler. Synchronous and non-blocking by
/// convention: long-running work should hand off to its own task.
pub type Handler = Box<dyn Fn(&ParsedMessage) + Send + Sync>;

/// One outbound message, prior to envelope construction (§4.4 `send`).
pub struct OutboundMessage {
    pub targets: Vec<String>,
    pub message_type: String,
    pub timeout_s: u64,
    pub data: Option<DataContent>,
    pub debug: Vec<Value>,
    pub destination_report: Option<bool>,
}

impl OutboundMessage {
    pub fn new(targets: Vec<String>, message_type: impl Into<String>, timeout_s: u64) -> Self {
        Self {
            targets,
            message_type: message_type.into(),
            timeout_s,
            data: None,
            debug: Vec::new(),
            destination_report: None,
        }
    }

    pub fn with_data(mut self, data: DataContent) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_debug(mut self, debug: Vec<Value>) -> Self {
        self.debug = debug;
        self
    }
}

struct HandlerTable {
    handlers: RwLock<HashMap<String, Handler>>,
    error_handler: Mutex<Option<Handler>>,
}

/// Resilient PCP protocol client (§2 components 5-7). Cheaply cloneable:
/// internals live behind an `Arc` so the reactor and monitor tasks can each
/// hold their own handle.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Arc<ClientIdentity>,
    broker_uris: Vec<String>,
    protocol: Protocol,
    registry: Arc<SchemaRegistry>,
    handlers: HandlerTable,
    connection: Mutex<Option<Arc<Connection>>>,
    association: Association,
    monitor_stop: AtomicBool,
    monitor_wake: Notify,
    monitor_exception: Mutex<Option<PcpError>>,
    monitor_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    monitor_running: AtomicBool,
    reactor_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Connector {
    pub fn new(identity: ClientIdentity, broker_uris: Vec<String>, protocol: Protocol) -> Result<Self> {
        let registry = Arc::new(SchemaRegistry::new());
        register_core_schemas(&registry)?;
        Ok(Self {
            inner: Arc::new(Inner {
                identity: Arc::new(identity),
                broker_uris,
                protocol,
                registry,
                handlers: HandlerTable {
                    handlers: RwLock::new(HashMap::new()),
                    error_handler: Mutex::new(None),
                },
                connection: Mutex::new(None),
                association: Association::new(),
                monitor_stop: AtomicBool::new(false),
                monitor_wake: Notify::new(),
                monitor_exception: Mutex::new(None),
                monitor_task: Mutex::new(None),
                monitor_running: AtomicBool::new(false),
                reactor_task: Mutex::new(None),
            }),
        })
    }

    /// Registers a schema and binds a handler to its name (§4.4). Fails
    /// with `SchemaRedefinition` if the schema name is already bound.
    pub async fn register_callback(
        &self,
        message_type: impl Into<String>,
        content_type: ContentType,
        document: &Value,
        handler: Handler,
    ) -> Result<()> {
        let message_type = message_type.into();
        self.inner
            .registry
            .register(Schema::compile(message_type.clone(), content_type, document)?)?;
        self.inner
            .handlers
            .handlers
            .write()
            .await
            .insert(message_type, handler);
        Ok(())
    }

    /// Single-slot error callback; last writer wins (§8).
    pub async fn set_error_callback(&self, handler: Handler) {
        *self.inner.handlers.error_handler.lock().await = Some(handler);
    }

    pub async fn is_connected(&self) -> bool {
        match self.inner.connection.lock().await.as_ref() {
            Some(conn) => matches!(conn.state().await, ConnectionState::Open),
            None => false,
        }
    }

    /// v1 only: whether the last Session Association attempt succeeded.
    pub async fn is_associated(&self) -> bool {
        self.inner.association.timings().await.success
    }

    pub async fn association_timings(&self) -> AssociationTimings {
        self.inner.association.timings().await
    }

    async fn ensure_connection(&self) -> Arc<Connection> {
        let mut guard = self.inner.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return conn.clone();
        }

        let (events_tx, events_rx) = mpsc::channel(256);
        let conn = Arc::new(Connection::new(
            self.inner.identity.clone(),
            BrokerList::new(self.resolved_broker_uris()),
            events_tx,
        ));
        *guard = Some(conn.clone());
        drop(guard);

        let reactor = self.clone();
        let handle = tokio::spawn(async move { reactor.run_reactor(events_rx).await });
        *self.inner.reactor_task.lock().await = Some(handle);

        conn
    }

    /// v2 appends `/<client_type>` to the broker URI when absent (§6);
    /// v1 broker URIs are used verbatim (path is fixed `/pcp`).
    fn resolved_broker_uris(&self) -> Vec<String> {
        match self.inner.protocol {
            Protocol::V1 => self.inner.broker_uris.clone(),
            Protocol::V2 => self
                .inner
                .broker_uris
                .iter()
                .map(|uri| {
                    let suffix = format!("/{}", self.inner.identity.client_type);
                    if uri.ends_with(&suffix) {
                        uri.clone()
                    } else {
                        format!("{}{}", uri.trim_end_matches('/'), suffix)
                    }
                })
                .collect(),
        }
    }

    /// Drives the connection toward `open` and, for v1, performs Session
    /// Association (§4.4 `connect`, §4.5).
    pub async fn connect(&self, max_attempts: u32) -> Result<()> {
        let conn = self.ensure_connection().await;

        match self.inner.protocol {
            Protocol::V2 => conn.connect(max_attempts).await,
            Protocol::V1 => self.connect_v1(&conn, max_attempts).await,
        }
    }

    async fn connect_v1(&self, conn: &Arc<Connection>, max_attempts: u32) -> Result<()> {
        use pcp_protocol::constants::ASSOCIATION_CLOSE_WAIT_S;

        // Step 1: the broker closes a second associate attempt on an
        // already-open socket anyway; close first and wait briefly.
        if matches!(
            conn.state().await,
            ConnectionState::Open | ConnectionState::Connecting
        ) {
            let _ = conn.close().await;
            conn.wait_closed(Duration::from_secs(ASSOCIATION_CLOSE_WAIT_S))
                .await;
        }

        // Steps 2-3: reset association state before the socket can possibly
        // open, so the reactor's on-open hook always finds a fresh request
        // id to associate with.
        let request_id = Uuid::new_v4().to_string();
        self.inner.association.begin(request_id).await;

        conn.connect(max_attempts).await?;

        // Step 4: wait for response, correlated failure, or timeout.
        let timeout = Duration::from_secs(self.inner.identity.timeouts.assoc_timeout_s);
        match self.inner.association.wait(timeout).await {
            AssociationOutcome::Succeeded => Ok(()),
            AssociationOutcome::ResponseFailure(reason) => {
                Err(PcpError::AssociationResponseFailure(reason))
            }
            AssociationOutcome::Failed(reason) => Err(PcpError::AssociationError(reason)),
            AssociationOutcome::TimedOut => {
                Err(PcpError::AssociationError("operation timeout".into()))
            }
        }
    }

    /// Constructs and sends one envelope (§4.4 `send`). `sender` is always
    /// `identity.uri`; `id` is always a fresh UUID (§3 invariants).
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        let conn = {
            let guard = self.inner.connection.lock().await;
            guard.as_ref().cloned().ok_or(PcpError::ConnectionNotInit)?
        };

        let id = Uuid::new_v4().to_string();
        let expires = (chrono::Utc::now() + chrono::Duration::seconds(message.timeout_s as i64))
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string();

        let bytes = match self.inner.protocol {
            Protocol::V1 => {
                let envelope = EnvelopeV1 {
                    id,
                    message_type: message.message_type,
                    expires,
                    targets: message.targets,
                    sender: self.inner.identity.uri.clone(),
                    destination_report: message.destination_report,
                };
                let envelope_bytes = serde_json::to_vec(&envelope)?;
                let data_bytes = message.data.as_ref().map(|d| match d {
                    DataContent::Json(v) => serde_json::to_vec(v).unwrap_or_default(),
                    DataContent::Binary(b) => b.clone(),
                });
                let debug_bytes: Vec<Vec<u8>> = message
                    .debug
                    .iter()
                    .map(|d| serde_json::to_vec(d).unwrap_or_default())
                    .collect();
                pcp_protocol::codec::v1::serialize_frame(
                    &envelope_bytes,
                    data_bytes
                        .as_deref()
                        .map(|b| (chunk_descriptor::DATA, b)),
                    &debug_bytes,
                )
            }
            Protocol::V2 => {
                let envelope = EnvelopeV2 {
                    id,
                    message_type: message.message_type,
                    target: message.targets.into_iter().next(),
                    sender: Some(self.inner.identity.uri.clone()),
                    in_reply_to: None,
                    data: message.data.map(|d| match d {
                        DataContent::Json(v) => v,
                        DataContent::Binary(b) => {
                            use base64::Engine;
                            Value::String(base64::engine::general_purpose::STANDARD.encode(&b))
                        }
                    }),
                };
                let value = serde_json::to_value(&envelope)?;
                pcp_protocol::codec::v2::serialize_frame(&value)?
            }
        };

        let kind = match self.inner.protocol {
            Protocol::V1 => WireKind::Binary,
            Protocol::V2 => WireKind::Text,
        };
        conn.send(bytes, kind).await
    }

    /// Reactor task: the only consumer of a `Connection`'s event queue
    /// (§9 "cyclic lifetimes" resolution). Drains `Open`/`Message`/`Pong`/
    /// `Closed` events and performs the codec parse + dispatch + Session
    /// Association bookkeeping that used to live in callback closures.
    async fn run_reactor(&self, mut events_rx: mpsc::Receiver<ConnectionEvent>) {
        while let Some(event) = events_rx.recv().await {
            let conn = {
                let guard = self.inner.connection.lock().await;
                guard.clone()
            };
            let Some(conn) = conn else { continue };

            match event {
                ConnectionEvent::Open => {
                    if self.inner.protocol == Protocol::V1 {
                        self.send_associate_request(&conn).await;
                    }
                }
                ConnectionEvent::Message(bytes) => {
                    self.process_message(&bytes).await;
                }
                ConnectionEvent::Pong => {
                    conn.note_pong_received().await;
                }
                ConnectionEvent::Closed { code, reason } => {
                    conn.mark_closed().await;
                    self.inner.association.note_closed().await;
                    debug!(?code, %reason, "connection closed");
                    self.inner.monitor_wake.notify_waiters();
                }
            }
        }
    }

    async fn send_associate_request(&self, conn: &Arc<Connection>) {
        let request_id = self.inner.association.request_id().await;
        let expires = (chrono::Utc::now()
            + chrono::Duration::seconds(self.inner.identity.timeouts.assoc_timeout_s as i64))
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string();
        let envelope = EnvelopeV1 {
            id: request_id,
            message_type: ASSOCIATE_REQ_TYPE.to_string(),
            expires,
            targets: vec!["pcp:///server".to_string()],
            sender: self.inner.identity.uri.clone(),
            destination_report: None,
        };
        let Ok(envelope_bytes) = serde_json::to_vec(&envelope) else {
            return;
        };
        let frame = pcp_protocol::codec::v1::serialize_frame(&envelope_bytes, None, &[]);
        if let Err(e) = conn.send(frame, WireKind::Binary).await {
            warn!(error = %e, "failed to send associate_request");
        }
    }

    /// Parses, validates, and dispatches one inbound frame (§4.4
    /// `process_message`).
    async fn process_message(&self, bytes: &[u8]) {
        let parsed = match self.inner.protocol {
            Protocol::V1 => pcp_protocol::codec::parse_v1(bytes, &self.inner.registry),
            Protocol::V2 => pcp_protocol::codec::parse_v2(bytes, &self.inner.registry),
        };

        let parsed = match parsed {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "AUTHORIZATION / DESERIALIZATION_ERROR: failed to parse inbound frame");
                if self.inner.protocol == Protocol::V1 {
                    self.inner.association.fail(e.to_string()).await;
                }
                return;
            }
        };

        let message_type = parsed.message_type().unwrap_or_default().to_string();
        let id = parsed.id().unwrap_or_default().to_string();
        let sender = parsed.sender().unwrap_or_default().to_string();
        info!(%message_type, %id, %sender, "processed inbound message");

        if self.inner.protocol == Protocol::V1 && message_type == ASSOCIATE_RESP_TYPE {
            self.dispatch_associate_response(&parsed).await;
            return;
        }

        // Layers the association-failure side effect on top of normal
        // dispatch below; a correlated error_message/ttl_expired/
        // version_error still reaches the error callback or a registered
        // handler the same as an uncorrelated one would.
        if self.inner.protocol == Protocol::V1 {
            self.note_association_correlation(&message_type, &parsed).await;
        }

        if message_type == ERROR_MSG_TYPE {
            self.dispatch_error(&parsed).await;
            return;
        }

        let handlers = self.inner.handlers.handlers.read().await;
        match handlers.get(message_type.as_str()) {
            Some(handler) => {
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&parsed))) {
                    error!(%message_type, ?panic, "handler panicked");
                }
            }
            None => {
                debug!(%message_type, "no handler registered, dropping message");
            }
        }
    }

    async fn dispatch_associate_response(&self, parsed: &ParsedMessage) {
        if let Some(data) = parsed.data_as_json() {
            let success = data.get("success").and_then(Value::as_bool).unwrap_or(false);
            let reason = data
                .get("reason")
                .and_then(Value::as_str)
                .map(|s| s.to_string());
            self.inner.association.complete_response(success, reason).await;
        }
    }

    /// Fails the in-flight Session Association when `message_type` is a
    /// `ttl_expired`, `version_error`, or `error_message` correlated to our
    /// request id (§4.5 correlation rule). Purely a side effect: it never
    /// suppresses delivery of the message to the error callback or a
    /// registered handler.
    async fn note_association_correlation(&self, message_type: &str, parsed: &ParsedMessage) {
        if message_type == TTL_EXPIRED_TYPE || message_type == VERSION_ERROR_TYPE {
            let request_id = self.inner.association.request_id().await;
            if let Some(cause_id) = parsed.data_as_json().and_then(|d| d.get("id")).and_then(Value::as_str) {
                if cause_id == request_id {
                    let reason = if message_type == TTL_EXPIRED_TYPE {
                        "Associate request's TTL expired".to_string()
                    } else {
                        "broker rejected client protocol version".to_string()
                    };
                    self.inner.association.fail(reason).await;
                }
            }
            return;
        }

        if message_type == ERROR_MSG_TYPE {
            let request_id = self.inner.association.request_id().await;
            let cause_id = parsed
                .data_as_json()
                .and_then(|d| d.get("id"))
                .and_then(Value::as_str)
                .or_else(|| parsed.data_as_json().and_then(Value::as_str));
            if cause_id == Some(request_id.as_str()) {
                let description = parsed
                    .data_as_json()
                    .and_then(|d| d.get("description"))
                    .and_then(Value::as_str)
                    .unwrap_or("error_message")
                    .to_string();
                self.inner.association.fail(description).await;
            }
        }
    }

    async fn dispatch_error(&self, parsed: &ParsedMessage) {
        let guard = self.inner.handlers.error_handler.lock().await;
        if let Some(handler) = guard.as_ref() {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| handler(parsed))) {
                error!(?panic, "error handler panicked");
            }
        } else {
            debug!("error_message received with no error callback registered");
        }
    }

    // ---- Monitor Task (§4.6) ----

    pub async fn start_monitoring(&self, max_attempts: u32, check_interval_s: u64) -> Result<()> {
        self.validate_monitor_timings(check_interval_s)?;
        if self.inner.monitor_running.swap(true, Ordering::SeqCst) {
            return Ok(()); // already running; §3 invariant: one monitor per Connector
        }
        self.inner.monitor_stop.store(false, Ordering::SeqCst);

        let connector = self.clone();
        let handle = tokio::spawn(async move {
            let result = connector.monitor_loop(max_attempts, check_interval_s).await;
            connector.inner.monitor_running.store(false, Ordering::SeqCst);
            if let Err(e) = result {
                *connector.inner.monitor_exception.lock().await = Some(e);
            }
        });
        *self.inner.monitor_task.lock().await = Some(handle);
        Ok(())
    }

    /// Blocking variant: runs the monitor loop on the caller's task instead
    /// of spawning one (§4.6).
    pub async fn monitor_connection(&self, max_attempts: u32, check_interval_s: u64) -> Result<()> {
        self.validate_monitor_timings(check_interval_s)?;
        if self.inner.monitor_running.swap(true, Ordering::SeqCst) {
            return Err(PcpError::ConnectionConfig(
                "a monitor task is already running for this connector".into(),
            ));
        }
        self.inner.monitor_stop.store(false, Ordering::SeqCst);
        let result = self.monitor_loop(max_attempts, check_interval_s).await;
        self.inner.monitor_running.store(false, Ordering::SeqCst);
        result
    }

    fn validate_monitor_timings(&self, check_interval_s: u64) -> Result<()> {
        if check_interval_s.saturating_mul(1000) <= self.inner.identity.timeouts.ws_pong_timeout_ms {
            return Err(PcpError::ConnectionConfig(format!(
                "check_interval_s ({check_interval_s}s) must exceed ws_pong_timeout_ms ({}ms)",
                self.inner.identity.timeouts.ws_pong_timeout_ms
            )));
        }
        Ok(())
    }

    async fn monitor_loop(&self, max_attempts: u32, check_interval_s: u64) -> Result<()> {
        use pcp_protocol::constants::MONITOR_RETRY_DELAY_MS;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(check_interval_s)) => {}
                _ = self.inner.monitor_wake.notified() => {}
            }

            if self.inner.monitor_stop.load(Ordering::SeqCst) {
                return Ok(());
            }

            if !self.is_connected().await {
                tokio::time::sleep(Duration::from_millis(MONITOR_RETRY_DELAY_MS)).await;
                match self.connect(max_attempts).await {
                    Ok(()) => {}
                    Err(e @ PcpError::ConnectionConfig(_)) => {
                        warn!(error = %e, "monitor: connection config error, continuing");
                    }
                    Err(e @ PcpError::ConnectionProcessing(_)) => {
                        warn!(error = %e, "monitor: transient processing error, continuing");
                    }
                    Err(e @ PcpError::AssociationError(_)) => {
                        warn!(error = %e, "monitor: association error, continuing");
                    }
                    Err(e @ PcpError::AssociationResponseFailure(_)) => {
                        error!(error = %e, "monitor: association response failure, stopping");
                        return Err(e);
                    }
                    Err(e @ PcpError::ConnectionFatal(_)) => {
                        error!(error = %e, "monitor: connection fatal, stopping");
                        return Err(e);
                    }
                    Err(e) => {
                        error!(error = %e, "monitor: unexpected error, stopping");
                        return Err(e);
                    }
                }
            } else {
                let conn = self.inner.connection.lock().await.clone();
                if let Some(conn) = conn {
                    let deadline_elapsed = matches!(
                        conn.pong_deadline().await,
                        Some(deadline) if std::time::Instant::now() >= deadline
                    );
                    if deadline_elapsed {
                        if conn.note_pong_deadline_elapsed().await {
                            let _ = conn.close_due_to_pong_timeout().await;
                        }
                    } else if let Err(e) = conn.ping().await {
                        warn!(error = %e, "monitor: ping failed, continuing");
                    }
                }
            }
        }
    }

    /// Stops the monitor task and re-raises any stored terminal error
    /// (§4.6, §5 cancellation contract).
    pub async fn stop_monitoring(&self) -> Result<()> {
        self.inner.monitor_stop.store(true, Ordering::SeqCst);
        self.inner.monitor_wake.notify_waiters();
        if let Some(handle) = self.inner.monitor_task.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(e) = self.inner.monitor_exception.lock().await.take() {
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for Inner {
    /// Best-effort cleanup: aborts the reactor and monitor tasks (we can't
    /// `.await` a clean shutdown from `Drop`) and logs, but never re-raises,
    /// any exception the monitor had stored (§4.6 destructor contract).
    fn drop(&mut self) {
        if let Ok(mut guard) = self.reactor_task.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        if let Ok(mut guard) = self.monitor_task.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        if let Ok(mut guard) = self.monitor_exception.try_lock() {
            if let Some(e) = guard.take() {
                warn!(error = %e, "Connector dropped with an unhandled monitor exception");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn v1_connector() -> Connector {
        let identity = crate::identity::test_support::dummy_identity();
        Connector::new(identity, vec!["wss://broker.example.com/pcp".into()], Protocol::V1).unwrap()
    }

    fn v2_connector() -> Connector {
        let identity = crate::identity::test_support::dummy_identity();
        Connector::new(identity, vec!["wss://broker.example.com".into()], Protocol::V2).unwrap()
    }

    #[test]
    fn v2_resolved_broker_uri_appends_client_type() {
        let connector = v2_connector();
        let uris = connector.resolved_broker_uris();
        assert_eq!(uris, vec!["wss://broker.example.com/agent".to_string()]);
    }

    #[test]
    fn v1_resolved_broker_uri_is_unchanged() {
        let connector = v1_connector();
        let uris = connector.resolved_broker_uris();
        assert_eq!(uris, vec!["wss://broker.example.com/pcp".to_string()]);
    }

    #[tokio::test]
    async fn register_callback_rejects_duplicate_schema() {
        let connector = v1_connector();
        let doc = serde_json::json!(true);
        connector
            .register_callback("custom/ping", ContentType::Json, &doc, Box::new(|_| {}))
            .await
            .unwrap();
        let err = connector
            .register_callback("custom/ping", ContentType::Json, &doc, Box::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, PcpError::SchemaRedefinition(name) if name == "custom/ping"));
    }

    #[tokio::test]
    async fn process_message_dispatches_to_registered_handler() {
        let connector = v1_connector();
        let doc = serde_json::json!({"type": "object", "required": ["n"]});
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        connector
            .register_callback(
                "custom/typed",
                ContentType::Json,
                &doc,
                Box::new(move |_msg| {
                    seen_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        let envelope = br#"{"id":"a","message_type":"custom/typed","expires":"2026-01-01T00:00:00Z","targets":[],"sender":"pcp://a/b"}"#;
        let bytes = pcp_protocol::codec::v1::serialize_frame(
            envelope,
            Some((chunk_descriptor::DATA, br#"{"n":1}"#)),
            &[],
        );
        connector.process_message(&bytes).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn process_message_with_no_handler_is_dropped_silently() {
        let connector = v1_connector();
        let envelope = br#"{"id":"a","message_type":"custom/unregistered","expires":"2026-01-01T00:00:00Z","targets":[],"sender":"pcp://a/b"}"#;
        let bytes = pcp_protocol::codec::v1::serialize_frame(envelope, None, &[]);
        connector.process_message(&bytes).await; // must not panic
    }

    #[tokio::test]
    async fn error_message_routes_to_error_callback() {
        let connector = v1_connector();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        connector
            .set_error_callback(Box::new(move |_msg| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let envelope = br#"{"id":"a","message_type":"http://puppetlabs.com/error_message","expires":"2026-01-01T00:00:00Z","targets":[],"sender":"pcp:///server"}"#;
        let data = br#"{"id":"unrelated-id","description":"boom"}"#;
        let bytes = pcp_protocol::codec::v1::serialize_frame(
            envelope,
            Some((chunk_descriptor::DATA, data)),
            &[],
        );
        connector.process_message(&bytes).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn correlated_ttl_expired_fails_association_instead_of_dispatching() {
        let connector = v1_connector();
        connector.inner.association.begin("req-1".into()).await;

        let envelope = br#"{"id":"b","message_type":"http://puppetlabs.com/ttl_expired","expires":"2026-01-01T00:00:00Z","targets":[],"sender":"pcp:///server"}"#;
        let data = br#"{"id":"req-1"}"#;
        let bytes = pcp_protocol::codec::v1::serialize_frame(
            envelope,
            Some((chunk_descriptor::DATA, data)),
            &[],
        );
        connector.process_message(&bytes).await;

        let outcome = connector
            .inner
            .association
            .wait(Duration::from_millis(50))
            .await;
        assert_eq!(
            outcome,
            AssociationOutcome::Failed("Associate request's TTL expired".into())
        );
    }

    #[tokio::test]
    async fn correlated_error_message_both_fails_association_and_reaches_callback() {
        let connector = v1_connector();
        connector.inner.association.begin("req-1".into()).await;
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        connector
            .set_error_callback(Box::new(move |_msg| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let envelope = br#"{"id":"b","message_type":"http://puppetlabs.com/error_message","expires":"2026-01-01T00:00:00Z","targets":[],"sender":"pcp:///server"}"#;
        let data = br#"{"id":"req-1","description":"boom"}"#;
        let bytes = pcp_protocol::codec::v1::serialize_frame(
            envelope,
            Some((chunk_descriptor::DATA, data)),
            &[],
        );
        connector.process_message(&bytes).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let outcome = connector
            .inner
            .association
            .wait(Duration::from_millis(50))
            .await;
        assert_eq!(outcome, AssociationOutcome::Failed("boom".into()));
    }

    #[tokio::test]
    async fn stale_correlated_response_after_settled_association_is_discarded() {
        let connector = v1_connector();
        connector.inner.association.begin("req-1".into()).await;
        connector
            .inner
            .association
            .complete_response(true, None)
            .await;

        let envelope = br#"{"id":"c","message_type":"http://puppetlabs.com/associate_response","expires":"2026-01-01T00:00:00Z","targets":[],"sender":"pcp:///server"}"#;
        let data = br#"{"id":"req-1","success":false,"reason":"late replay"}"#;
        let bytes = pcp_protocol::codec::v1::serialize_frame(
            envelope,
            Some((chunk_descriptor::DATA, data)),
            &[],
        );
        connector.process_message(&bytes).await;

        // The stale response must not flip the already-settled outcome.
        assert!(connector.is_associated().await);
    }

    #[tokio::test]
    async fn associate_response_success_completes_association() {
        let connector = v1_connector();
        connector.inner.association.begin("req-1".into()).await;

        let envelope = br#"{"id":"c","message_type":"http://puppetlabs.com/associate_response","expires":"2026-01-01T00:00:00Z","targets":[],"sender":"pcp:///server"}"#;
        let data = br#"{"id":"req-1","success":true}"#;
        let bytes = pcp_protocol::codec::v1::serialize_frame(
            envelope,
            Some((chunk_descriptor::DATA, data)),
            &[],
        );
        connector.process_message(&bytes).await;

        assert!(connector.is_associated().await);
    }

    #[tokio::test]
    async fn monitor_rejects_check_interval_not_exceeding_pong_timeout() {
        let connector = v1_connector();
        let err = connector.start_monitoring(0, 1).await.unwrap_err();
        assert!(matches!(err, PcpError::ConnectionConfig(_)));
    }

    #[tokio::test]
    async fn send_before_connect_is_not_init() {
        let connector = v1_connector();
        let msg = OutboundMessage::new(vec!["pcp://a/b".into()], "custom/ping", 10);
        let err = connector.send(msg).await.unwrap_err();
        assert!(matches!(err, PcpError::ConnectionNotInit));
    }
}
