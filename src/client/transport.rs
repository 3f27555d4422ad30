//! Client websocket transport to the gateway
//!
//! Splits the persistent connection into an outbound `ClientPacket` sender
//! and an inbound `ServerPacket` stream. A transport failure closes both
//! halves; the caller performs local cleanup and surfaces a notice — there
//! is no automatic reconnect.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientPacket, ServerPacket};
use crate::{Error, Result};

/// Liveness aid between session creation and transport binding, so the
/// transport does not open before server-side state exists. Not a
/// correctness dependency.
pub const BIND_DELAY: Duration = Duration::from_millis(150);

/// A connected session transport
pub struct SessionTransport {
    /// Outbound packet sender (capture uplink and typed text)
    pub outbound: mpsc::Sender<ClientPacket>,
    /// Inbound ordered packet stream
    pub inbound: mpsc::Receiver<ServerPacket>,
}

/// Connect to a session's packet stream
///
/// # Errors
///
/// Returns `Error::Transport` when the websocket connection cannot be
/// established
pub async fn connect(gateway_url: &str, session_id: &str) -> Result<SessionTransport> {
    let url = format!(
        "{}/sessions/{session_id}/stream",
        gateway_url.trim_end_matches('/')
    );

    let (socket, _response) = connect_async(&url)
        .await
        .map_err(|e| Error::Transport(format!("websocket connect failed: {e}")))?;
    tracing::info!(session_id, "session transport connected");

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientPacket>(32);
    let (inbound_tx, inbound_rx) = mpsc::channel::<ServerPacket>(32);

    // Writer half: serialize outbound packets onto the socket
    tokio::spawn(async move {
        while let Some(packet) = outbound_rx.recv().await {
            let Ok(text) = packet.to_json() else {
                tracing::warn!("failed to encode outbound packet");
                continue;
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                tracing::warn!(error = %e, "transport send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader half: decode inbound packets in arrival order
    let reader_session = session_id.to_string();
    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match ServerPacket::from_json(&text) {
                    Ok(packet) => {
                        if inbound_tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "rejecting unknown packet");
                    }
                },
                Ok(Message::Close(frame)) => {
                    tracing::info!(session_id = %reader_session, ?frame, "transport closed by gateway");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "transport receive failed");
                    break;
                }
            }
        }
        // Dropping inbound_tx ends the reducer loop, which triggers local
        // cleanup on the caller's side
    });

    Ok(SessionTransport {
        outbound: outbound_tx,
        inbound: inbound_rx,
    })
}

/// Connect after the fixed post-create delay
///
/// # Errors
///
/// Returns `Error::Transport` when the connection cannot be established
pub async fn connect_after_create(gateway_url: &str, session_id: &str) -> Result<SessionTransport> {
    tokio::time::sleep(BIND_DELAY).await;
    connect(gateway_url, session_id).await
}
