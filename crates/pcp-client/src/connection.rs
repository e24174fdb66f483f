//! `Connection`: one WebSocket endpoint, its state machine, broker failover,
//! and keep-alive bookkeeping (§4.1).
//!
//! `connect` drives the failover+backoff loop directly as a single type
//! rather than a free-standing reconnect loop, since PCP has exactly one
//! `Connection` per `Connector`.
//!
//! `Connection` never holds a reference back to its `Connector`: it only
//! holds a channel of [`ConnectionEvent`]s that the Connector's reactor task
//! drains, avoiding a cyclic ownership relationship between the two.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pcp_protocol::error::{PcpError, Result};

use crate::identity::ClientIdentity;
use crate::types::{BrokerList, ConnectionState, ConnectionTimings, ReconnectConfig};

/// Events the read pump publishes to whoever is driving this `Connection`
/// (the `Connector`'s reactor task). See §9: giving the Connection only a
/// typed event queue instead of callbacks that close over the Connector.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The WebSocket handshake completed; state is now `Open`.
    Open,
    /// A complete inbound frame (v1 binary-chunked or v2 JSON text).
    Message(Vec<u8>),
    /// A pong arrived; resets the consecutive-pong-timeout counter (§4.1).
    Pong,
    /// The connection dropped, locally or from the peer.
    Closed { code: Option<u16>, reason: String },
}

/// Whether an outbound frame should be sent as a WebSocket text or binary
/// message. v1 frames are binary-chunked; v2 frames are a JSON text object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    Text,
    Binary,
}

struct PumpHandles {
    cancel: CancellationToken,
    write_tx: mpsc::Sender<tungstenite::Message>,
    _read: tokio::task::JoinHandle<()>,
    _write: tokio::task::JoinHandle<()>,
}

/// One WebSocket endpoint with failover across [`BrokerList`] and the
/// pong-timeout keep-alive counter (§4.1).
pub struct Connection {
    identity: Arc<ClientIdentity>,
    brokers: BrokerList,
    reconnect: ReconnectConfig,
    events_tx: mpsc::Sender<ConnectionEvent>,
    state: Mutex<ConnectionState>,
    timings: Mutex<ConnectionTimings>,
    pumps: Mutex<Option<PumpHandles>>,
    pong_deadline: Mutex<Option<Instant>>,
    consecutive_pong_timeouts: AtomicU32,
    pong_timeouts_before_retry: u32,
    ws_pong_timeout_ms: u64,
    had_success: AtomicBool,
    state_changed: Notify,
}

impl Connection {
    pub fn new(
        identity: Arc<ClientIdentity>,
        brokers: BrokerList,
        events_tx: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        let timeouts = identity.timeouts.clone();
        Self {
            identity,
            brokers,
            reconnect: ReconnectConfig::default(),
            events_tx,
            state: Mutex::new(ConnectionState::Initialized),
            timings: Mutex::new(ConnectionTimings::default()),
            pumps: Mutex::new(None),
            pong_deadline: Mutex::new(None),
            consecutive_pong_timeouts: AtomicU32::new(0),
            pong_timeouts_before_retry: timeouts.pong_timeouts_before_retry,
            ws_pong_timeout_ms: timeouts.ws_pong_timeout_ms,
            had_success: AtomicBool::new(false),
            state_changed: Notify::new(),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    pub async fn timings(&self) -> ConnectionTimings {
        self.timings.lock().await.clone()
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.lock().await = state;
        self.state_changed.notify_waiters();
    }

    /// Drives the FSM toward `Open`, failing over across brokers with
    /// exponential backoff (§4.1, steps 1-5). `max_attempts == 0` means
    /// unbounded retries.
    pub async fn connect(&self, max_attempts: u32) -> Result<()> {
        if matches!(self.state().await, ConnectionState::Open) {
            return Ok(());
        }

        // The cursor advances once on the first reconnect after a
        // previously successful session (§3, §4.1), in addition to
        // advancing per failed attempt inside the loop below.
        if self.had_success.load(Ordering::SeqCst) {
            self.brokers.advance();
        }

        self.set_state(ConnectionState::Connecting).await;

        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            self.timings.lock().await.reset();
            self.timings.lock().await.start = Some(Instant::now());
            self.timings.lock().await.connection_started = true;

            let target = self.brokers.current().to_string();
            self.timings.lock().await.tcp_pre_init = Some(Instant::now());
            match self.try_connect_once(&target).await {
                Ok(stream) => {
                    let mut timings = self.timings.lock().await;
                    timings.tcp_post_init = Some(Instant::now());
                    timings.open = Some(Instant::now());
                    drop(timings);
                    self.spawn_pumps(stream).await;
                    self.had_success.store(true, Ordering::SeqCst);
                    self.set_state(ConnectionState::Open).await;
                    let _ = self.events_tx.send(ConnectionEvent::Open).await;
                    info!(broker = %target, attempt, "connection open");
                    return Ok(());
                }
                Err(e @ PcpError::ConnectionConfig(_)) => {
                    // A bad cert/key/CA pairing won't fix itself on retry;
                    // fail immediately rather than burn the attempt budget.
                    self.timings.lock().await.connection_failed = true;
                    self.set_state(ConnectionState::Closed).await;
                    return Err(e);
                }
                Err(e) => {
                    self.timings.lock().await.connection_failed = true;
                    self.brokers.advance();
                    warn!(broker = %target, attempt, error = %e, "connect attempt failed");

                    if max_attempts != 0 && attempt >= max_attempts {
                        self.set_state(ConnectionState::Closed).await;
                        return Err(PcpError::ConnectionFatal(format!(
                            "exhausted {attempt} connection attempt(s) against {target}: {e}"
                        )));
                    }

                    let mut rng = rand::thread_rng();
                    let backoff = self
                        .reconnect
                        .backoff_for_attempt(attempt.saturating_sub(1), rng.gen());
                    let sleep = self.reconnect.jittered_sleep(backoff, rng.gen());
                    debug!(delay_ms = sleep.as_millis() as u64, "backing off before retry");
                    tokio::time::sleep(sleep).await;
                }
            }
        }
    }

    async fn try_connect_once(
        &self,
        url: &str,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let tls_config = self.identity.build_tls_config()?;
        let connector = tokio_tungstenite::Connector::Rustls(tls_config);
        let timeout = Duration::from_millis(self.identity.timeouts.ws_connection_timeout_ms);

        let connect_fut = async {
            match self.identity.proxy_uri.as_deref() {
                Some(proxy_uri) => {
                    let tcp = connect_through_proxy(proxy_uri, url).await?;
                    tokio_tungstenite::client_async_tls_with_config(url, tcp, None, Some(connector))
                        .await
                        .map(|(stream, _response)| stream)
                        .map_err(|e| PcpError::ConnectionProcessing(e.to_string()))
                }
                None => tokio_tungstenite::connect_async_tls_with_config(url, None, false, Some(connector))
                    .await
                    .map(|(stream, _response)| stream)
                    .map_err(|e| PcpError::ConnectionProcessing(e.to_string())),
            }
        };
        match tokio::time::timeout(timeout, connect_fut).await {
            Ok(result) => result,
            Err(_) => Err(PcpError::ConnectionProcessing(format!(
                "connection attempt to {url} timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn spawn_pumps(
        &self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (write, read) = stream.split();
        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let cancel = CancellationToken::new();

        self.consecutive_pong_timeouts.store(0, Ordering::SeqCst);
        *self.pong_deadline.lock().await = None;

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel))
        };

        let read_handle = {
            let events_tx = self.events_tx.clone();
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                crate::pumps::read::read_pump(read, events_tx, write_tx, cancel).await;
            })
        };

        *self.pumps.lock().await = Some(PumpHandles {
            cancel,
            write_tx,
            _read: read_handle,
            _write: write_handle,
        });
    }

    /// Sends one complete frame. Never blocks (§4.1, §5): a full outbound
    /// channel or a missing connection both fail with `ConnectionProcessing`.
    pub async fn send(&self, bytes: Vec<u8>, kind: WireKind) -> Result<()> {
        let guard = self.pumps.lock().await;
        let pumps = guard
            .as_ref()
            .ok_or(PcpError::ConnectionNotInit)?;
        let msg = match kind {
            WireKind::Text => tungstenite::Message::Text(
                String::from_utf8(bytes)
                    .map_err(|e| PcpError::MessageSerialization(e.to_string()))?
                    .into(),
            ),
            WireKind::Binary => tungstenite::Message::Binary(bytes.into()),
        };
        pumps
            .write_tx
            .try_send(msg)
            .map_err(|e| PcpError::ConnectionProcessing(format!("send failed: {e}")))
    }

    /// Sends a WebSocket ping and arms the pong-timeout deadline. Never
    /// blocks. Called by the Monitor Task (§4.1, §4.6) — the Connection
    /// itself never initiates pings on a timer.
    pub async fn ping(&self) -> Result<()> {
        let guard = self.pumps.lock().await;
        let pumps = guard.as_ref().ok_or(PcpError::ConnectionNotInit)?;
        *self.pong_deadline.lock().await =
            Some(Instant::now() + Duration::from_millis(self.ws_pong_timeout_ms));
        pumps
            .write_tx
            .try_send(tungstenite::Message::Ping(Vec::new().into()))
            .map_err(|e| PcpError::ConnectionProcessing(format!("ping failed: {e}")))
    }

    /// Resets the pong-timeout deadline; called by the read pump whenever a
    /// pong arrives (§4.1 invariant: any pong resets the counter to 0).
    pub(crate) async fn note_pong_received(&self) {
        *self.pong_deadline.lock().await = None;
        self.consecutive_pong_timeouts.store(0, Ordering::SeqCst);
    }

    /// Checks whether the armed pong deadline has elapsed; if so increments
    /// the consecutive-timeout counter and reports whether the
    /// `pong_timeouts_before_retry` threshold has now been reached.
    pub(crate) async fn note_pong_deadline_elapsed(&self) -> bool {
        *self.pong_deadline.lock().await = None;
        let count = self.consecutive_pong_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
        count >= self.pong_timeouts_before_retry
    }

    pub(crate) async fn pong_deadline(&self) -> Option<Instant> {
        *self.pong_deadline.lock().await
    }

    /// Local close, e.g. from the Connector tearing down (§4.1: open →
    /// closing on local `close`). Never blocks.
    pub async fn close(&self) -> Result<()> {
        self.close_with(None).await
    }

    /// Self-closes after `pong_timeouts_before_retry` consecutive missed
    /// pongs (§4.1: "closes itself with code 1000 reason 'consecutive
    /// onPongTimeouts'"). Called from the Monitor Task, never from the read
    /// pump, so the close decision never reentrantly races the event loop
    /// that detected it.
    pub(crate) async fn close_due_to_pong_timeout(&self) -> Result<()> {
        warn!("closing: consecutive onPongTimeouts");
        self.close_with(Some((
            tungstenite::protocol::frame::coding::CloseCode::Normal,
            "consecutive onPongTimeouts",
        )))
        .await
    }

    async fn close_with(&self, frame: Option<(tungstenite::protocol::frame::coding::CloseCode, &str)>) -> Result<()> {
        self.set_state(ConnectionState::Closing).await;
        self.timings.lock().await.closing_handshake = Some(Instant::now());
        let guard = self.pumps.lock().await;
        if let Some(pumps) = guard.as_ref() {
            let close_frame = frame.map(|(code, reason)| tungstenite::protocol::CloseFrame {
                code,
                reason: reason.into(),
            });
            let _ = pumps
                .write_tx
                .try_send(tungstenite::Message::Close(close_frame));
            pumps.cancel.cancel();
        }
        drop(guard);
        self.timings.lock().await.close = Some(Instant::now());
        self.set_state(ConnectionState::Closed).await;
        Ok(())
    }

    /// Transitions to `Closed` on a peer-initiated or error-driven drop
    /// (i.e. one the reactor learned about via [`ConnectionEvent::Closed`]
    /// rather than by calling [`Connection::close`] itself).
    pub(crate) async fn mark_closed(&self) {
        self.timings.lock().await.close = Some(Instant::now());
        self.set_state(ConnectionState::Closed).await;
    }

    /// Waits (bounded) for the connection to reach `Closed`, used by v1's
    /// re-association preamble (§4.5 step 1: "wait up to 5s for closed").
    pub async fn wait_closed(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if matches!(self.state().await, ConnectionState::Closed) {
                return;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return;
            }
            tokio::select! {
                _ = self.state_changed.notified() => {}
                _ = tokio::time::sleep(remaining) => return,
            }
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }
}

/// Establishes the raw TCP stream for a broker connection by tunneling
/// through an HTTP(S) `CONNECT` proxy (§6: "forwarded to the WebSocket
/// layer's `set_proxy`"). The returned stream is handed to
/// `client_async_tls_with_config`, which performs the TLS handshake and the
/// WebSocket upgrade over it exactly as it would over a direct connection.
async fn connect_through_proxy(proxy_uri: &str, target_url: &str) -> Result<TcpStream> {
    let proxy = url::Url::parse(proxy_uri)
        .map_err(|e| PcpError::ConnectionConfig(format!("invalid proxy URI '{proxy_uri}': {e}")))?;
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| PcpError::ConnectionConfig(format!("proxy URI '{proxy_uri}' has no host")))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(8080);

    let target = url::Url::parse(target_url)
        .map_err(|e| PcpError::ConnectionConfig(format!("invalid broker URI '{target_url}': {e}")))?;
    let target_host = target
        .host_str()
        .ok_or_else(|| PcpError::ConnectionConfig(format!("broker URI '{target_url}' has no host")))?;
    let target_port = target
        .port_or_known_default()
        .ok_or_else(|| PcpError::ConnectionConfig(format!("broker URI '{target_url}' has no port")))?;

    let mut stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(|e| {
            PcpError::ConnectionProcessing(format!("failed to reach proxy {proxy_host}:{proxy_port}: {e}"))
        })?;

    let request =
        format!("CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| PcpError::ConnectionProcessing(format!("failed writing CONNECT request: {e}")))?;

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| PcpError::ConnectionProcessing(format!("failed reading CONNECT response: {e}")))?;
        if n == 0 {
            return Err(PcpError::ConnectionProcessing(
                "proxy closed the connection during the CONNECT handshake".into(),
            ));
        }
        response.push(byte[0]);
        if response.ends_with(b"\r\n\r\n") {
            break;
        }
        if response.len() > 8192 {
            return Err(PcpError::ConnectionProcessing(
                "proxy CONNECT response exceeded the header size limit".into(),
            ));
        }
    }

    let status_line = String::from_utf8_lossy(&response);
    let status_line = status_line.lines().next().unwrap_or_default();
    if !status_line.contains(" 200 ") {
        return Err(PcpError::ConnectionProcessing(format!(
            "proxy CONNECT to {target_host}:{target_port} failed: {status_line}"
        )));
    }

    Ok(stream)
}
