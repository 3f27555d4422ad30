//! Websocket packet stream for live sessions
//!
//! Binds the single live transport to a session, relays the pipeline's
//! ordered event stream down as typed packets, and forwards inbound
//! audio/text/control packets up to the pipeline. Packets for a given
//! interaction go down in causal order: `NEW_INTERACTION` is queued before
//! the text it announces is pushed to the pipeline, and all pipeline events
//! flow through one channel.

use std::sync::{Arc, Mutex};

use axum::{
    Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::ApiState;
use crate::audio::format;
use crate::pipeline::{PipelineEvent, PipelineStream};
use crate::protocol::{ClientPacket, ServerPacket};
use crate::session::StoredMessage;
use crate::{Error, Result};

/// Close code for a transport bound to an unknown session
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4404;

/// Close code for a session that already has a live transport
pub const CLOSE_ALREADY_BOUND: u16 = 4409;

/// Build the websocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/sessions/{session_id}/stream", get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<ApiState>, session_id: String) {
    // Refuse to bind with a distinguishable close condition, never a silent
    // drop
    let (pipeline, mut unloaded) = match state.registry.bind_transport(&session_id).await {
        Ok(bound) => bound,
        Err(e) => {
            let (code, reason) = match e {
                Error::SessionNotFound(_) => (CLOSE_SESSION_NOT_FOUND, "session not found"),
                _ => (CLOSE_ALREADY_BOUND, "transport already bound"),
            };
            tracing::warn!(session_id = %session_id, code, "refusing transport bind");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    tracing::info!(session_id = %session_id, "transport bound");

    let mut stream = pipeline.open(&session_id);
    let events = stream.events();

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerPacket>(64);

    // Interaction currently open on this transport; a typed text arriving
    // while one is open cancels it first (barge-in)
    let open_interaction = Arc::new(Mutex::new(None::<String>));

    // Writer half: one task serializes all downstream packets in queue order
    let mut send_task = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            let Ok(text) = packet.to_json() else {
                tracing::warn!("failed to encode downstream packet");
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Pump half: relay the pipeline's ordered events 1:1
    let pump_registry = Arc::clone(&state.registry);
    let pump_session = session_id.clone();
    let pump_tx = tx.clone();
    let pump_open = Arc::clone(&open_interaction);
    let mut pump_task = tokio::spawn(async move {
        let Some(mut events) = events else {
            return;
        };
        while let Some(event) = events.recv().await {
            track_open_interaction(&pump_open, &event);
            if let PipelineEvent::Text {
                interaction_id,
                from_agent,
                text,
                is_final: true,
                ..
            } = &event
            {
                pump_registry
                    .record_message(
                        &pump_session,
                        StoredMessage {
                            interaction_id: interaction_id.clone(),
                            from_agent: *from_agent,
                            text: text.clone(),
                            timestamp: Utc::now(),
                        },
                    )
                    .await;
            }
            if pump_tx.send(packet_from(event)).await.is_err() {
                break;
            }
        }
    });

    // Inbound half: arrival order is processing order
    let session_for_recv = session_id.clone();
    let recv_open = Arc::clone(&open_interaction);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => {
                    handle_packet(&text, &mut stream, &tx, &recv_open, &session_for_recv).await;
                }
                Message::Close(_) => {
                    tracing::info!(session_id = %session_for_recv, "transport closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => { recv_task.abort(); pump_task.abort(); }
        _ = &mut recv_task => { send_task.abort(); pump_task.abort(); }
        _ = &mut pump_task => { send_task.abort(); recv_task.abort(); }
        _ = &mut unloaded => {
            tracing::info!(session_id = %session_id, "session unloaded, closing transport");
            send_task.abort();
            recv_task.abort();
            pump_task.abort();
        }
    }

    state.registry.release_transport(&session_id).await;
    tracing::info!(session_id = %session_id, "transport released");
}

/// Keep the open-interaction cell in step with the pipeline's event stream
fn track_open_interaction(open: &Mutex<Option<String>>, event: &PipelineEvent) {
    let Ok(mut open) = open.lock() else { return };
    match event {
        PipelineEvent::NewInteraction { interaction_id } => {
            *open = Some(interaction_id.clone());
        }
        PipelineEvent::InteractionEnd { interaction_id }
        | PipelineEvent::Cancelled { interaction_id } => {
            if open.as_deref() == Some(interaction_id) {
                *open = None;
            }
        }
        _ => {}
    }
}

/// Handle one inbound packet; a failure affects only that packet
async fn handle_packet(
    text: &str,
    stream: &mut Box<dyn PipelineStream>,
    tx: &mpsc::Sender<ServerPacket>,
    open_interaction: &Mutex<Option<String>>,
    session_id: &str,
) {
    let packet = match ClientPacket::from_json(text) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::warn!(session_id, error = %e, "rejecting unknown inbound packet");
            return;
        }
    };

    match packet {
        ClientPacket::Audio { chunks } => {
            // Arrival order, chunk by chunk; one bad chunk never aborts the
            // session
            for (index, chunk) in chunks.iter().enumerate() {
                match decode_chunk(chunk) {
                    Ok(samples) => {
                        if let Err(e) = stream.push_audio(samples).await {
                            tracing::warn!(session_id, index, error = %e, "audio chunk forward failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(session_id, index, error = %e, "dropping malformed audio chunk");
                    }
                }
            }
        }
        ClientPacket::Text { text } => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return;
            }

            // Barge-in: a new typed turn aborts the response still in flight
            let previous = open_interaction
                .lock()
                .ok()
                .and_then(|mut open| open.take());
            if let Some(previous) = previous {
                if let Err(e) = stream.cancel(&previous).await {
                    tracing::warn!(session_id, error = %e, "cancel of open interaction failed");
                }
            }

            let interaction_id = Uuid::new_v4().to_string();
            if let Ok(mut open) = open_interaction.lock() {
                *open = Some(interaction_id.clone());
            }
            // Causal order: announce the interaction before any pipeline
            // output referencing it can exist
            if tx
                .send(ServerPacket::NewInteraction {
                    interaction_id: interaction_id.clone(),
                })
                .await
                .is_err()
            {
                return;
            }
            if let Err(e) = stream.push_text(&interaction_id, trimmed).await {
                tracing::error!(session_id, error = %e, "text forward failed");
                let _ = tx
                    .send(ServerPacket::Error {
                        message: format!("response generation failed: {e}"),
                    })
                    .await;
            }
        }
        ClientPacket::AudioSessionEnd => {
            if let Err(e) = stream.end_audio().await {
                tracing::warn!(session_id, error = %e, "audio session end forward failed");
            }
        }
    }
}

fn decode_chunk(chunk: &str) -> Result<Vec<f32>> {
    format::decode_payload(chunk)
}

/// Map a pipeline event to its wire packet
fn packet_from(event: PipelineEvent) -> ServerPacket {
    match event {
        PipelineEvent::NewInteraction { interaction_id } => {
            ServerPacket::NewInteraction { interaction_id }
        }
        PipelineEvent::Text {
            interaction_id,
            utterance_id,
            from_agent,
            text,
            is_final,
        } => ServerPacket::Text {
            interaction_id,
            utterance_id,
            from_agent,
            text,
            is_final,
        },
        PipelineEvent::SpeechComplete {
            interaction_id,
            metadata,
        } => ServerPacket::UserSpeechComplete {
            interaction_id,
            metadata,
        },
        PipelineEvent::Audio {
            interaction_id,
            seq,
            samples,
        } => ServerPacket::Audio {
            interaction_id,
            seq,
            payload: format::encode_payload(&samples),
        },
        PipelineEvent::Cancelled { interaction_id } => {
            ServerPacket::CancelResponse { interaction_id }
        }
        PipelineEvent::InteractionEnd { interaction_id } => {
            ServerPacket::InteractionEnd { interaction_id }
        }
        PipelineEvent::Error { message } => ServerPacket::Error { message },
    }
}
