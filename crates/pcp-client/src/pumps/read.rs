//! WebSocket read pump — dispatches incoming frames.
//!
//! Unlike the codec-aware dispatch in `Connector::process_message`, this
//! pump only moves bytes: it hands complete text/binary frames upstream as
//! [`ConnectionEvent::Message`] and leaves wire-version parsing, and the
//! pong-timeout deadline bookkeeping (§4.1), to the Connector's reactor.

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use futures_util::StreamExt;

use crate::connection::ConnectionEvent;

/// Reads frames from the WebSocket until cancelled or the stream ends,
/// forwarding them as [`ConnectionEvent`]s. Responds to peer pings with a
/// pong automatically.
pub(crate) async fn read_pump<S>(
    mut read: S,
    events_tx: mpsc::Sender<ConnectionEvent>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let (code, reason) = loop {
        tokio::select! {
            _ = cancel.cancelled() => break (None, "local close".to_string()),
            msg = read.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        trace!(len = text.len(), "received text frame");
                        let _ = events_tx.send(ConnectionEvent::Message(text.as_bytes().to_vec())).await;
                    }
                    Some(Ok(tungstenite::Message::Binary(data))) => {
                        trace!(len = data.len(), "received binary frame");
                        let _ = events_tx.send(ConnectionEvent::Message(data.to_vec())).await;
                    }
                    Some(Ok(tungstenite::Message::Ping(data))) => {
                        trace!("received ping, sending pong");
                        let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                    }
                    Some(Ok(tungstenite::Message::Pong(_))) => {
                        trace!("received pong");
                        let _ = events_tx.send(ConnectionEvent::Pong).await;
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        debug!(?code, "received close frame");
                        break (code, reason);
                    }
                    Some(Ok(_)) => {} // frame kind we don't act on (raw frame, etc.)
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break (None, e.to_string());
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break (None, "stream ended".to_string());
                    }
                }
            }
        }
    };

    let _ = events_tx.send(ConnectionEvent::Closed { code, reason }).await;
}
