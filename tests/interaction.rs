//! End-to-end interaction flow tests: the client reducer over a stubbed
//! avatar bridge, and the websocket packet stream against a live gateway

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use presence_gateway::audio::{AudioOutputRouter, PlaybackQueue, format};
use presence_gateway::avatar::{AvatarSessionAdapter, BridgeEvent, TokenClient};
use presence_gateway::client::reducer::CaptureCommand;
use presence_gateway::protocol::{ClientPacket, ServerPacket, SpeechMetadata};
use presence_gateway::session::CreateSession;
use presence_gateway::{ChatHistoryItem, ClientInteractionReducer, Origin};

mod common;
use common::{ScriptedPipeline, StubBridge, scripted_registry, settle, spawn_gateway};

/// Reducer over an adapter that never started; all audio routes locally
fn local_only_reducer(auto_interrupt: bool) -> (ClientInteractionReducer, Arc<StubBridge>) {
    let (bridge, _feed) = StubBridge::with_feed();
    let tokens = TokenClient::new("http://127.0.0.1:1", Some("cred".to_string()));
    let adapter = Arc::new(AvatarSessionAdapter::new(
        Arc::clone(&bridge) as Arc<dyn presence_gateway::avatar::AvatarBridge>,
        tokens,
    ));
    let output = AudioOutputRouter::new(adapter, PlaybackQueue::new());
    (ClientInteractionReducer::new(output, auto_interrupt), bridge)
}

/// Reducer over a started adapter whose bridge events the test feeds
async fn bridged_reducer() -> (
    ClientInteractionReducer,
    Arc<StubBridge>,
    mpsc::Sender<BridgeEvent>,
) {
    let (bridge, feed) = StubBridge::with_feed();
    let tokens = common::token_service_client().await;
    let adapter = Arc::new(AvatarSessionAdapter::new(
        Arc::clone(&bridge) as Arc<dyn presence_gateway::avatar::AvatarBridge>,
        tokens,
    ));
    adapter.start("avatar-test", None).await.unwrap();
    let output = AudioOutputRouter::new(adapter, PlaybackQueue::new());
    (ClientInteractionReducer::new(output, true), bridge, feed)
}

fn user_text(interaction: &str, utterance: &str, text: &str, is_final: bool) -> ServerPacket {
    ServerPacket::Text {
        interaction_id: interaction.to_string(),
        utterance_id: utterance.to_string(),
        from_agent: false,
        text: text.to_string(),
        is_final,
    }
}

#[tokio::test]
async fn partials_reconcile_into_one_normalized_final() {
    let (mut reducer, _bridge) = local_only_reducer(true);

    reducer
        .apply(ServerPacket::NewInteraction {
            interaction_id: "i1".to_string(),
        })
        .await;
    reducer.apply(user_text("i1", "u1", "hel", false)).await;
    reducer.apply(user_text("i1", "u1", "hello th", false)).await;
    reducer.apply(user_text("i1", "u1", "hello there", true)).await;

    let utterances: Vec<_> = reducer.utterances().collect();
    assert_eq!(utterances.len(), 1);
    assert_eq!(utterances[0].text, "Hello there.");
    assert_eq!(utterances[0].origin, Origin::User);
    assert!(!utterances[0].recognizing);
}

#[tokio::test]
async fn empty_user_text_is_discarded_but_agent_text_is_kept() {
    let (mut reducer, _bridge) = local_only_reducer(true);

    reducer.apply(user_text("i1", "u1", "   ", true)).await;
    assert_eq!(reducer.utterances().count(), 0);

    reducer
        .apply(ServerPacket::Text {
            interaction_id: "i1".to_string(),
            utterance_id: "a1".to_string(),
            from_agent: true,
            text: String::new(),
            is_final: true,
        })
        .await;
    assert_eq!(reducer.utterances().count(), 1);
}

#[tokio::test]
async fn final_text_after_the_interaction_closed_starts_a_fresh_item() {
    let (mut reducer, _bridge) = local_only_reducer(true);

    reducer.apply(user_text("i1", "u1", "first", false)).await;
    reducer.apply(user_text("i1", "u1", "first", true)).await;
    reducer
        .apply(ServerPacket::InteractionEnd {
            interaction_id: "i1".to_string(),
        })
        .await;

    // A late final for the closed interaction must not touch the finished
    // exchange behind the boundary
    reducer.apply(user_text("i1", "u9", "late", true)).await;

    let utterances: Vec<_> = reducer.utterances().collect();
    assert_eq!(utterances.len(), 2);
    assert_eq!(utterances[0].text, "First.");
    assert_eq!(utterances[1].text, "Late.");
    assert!(matches!(
        reducer.history()[1],
        ChatHistoryItem::InteractionBoundary { .. }
    ));
}

#[tokio::test]
async fn latency_derives_from_speech_complete_to_first_audio() {
    let (mut reducer, _bridge) = local_only_reducer(true);

    reducer
        .apply(ServerPacket::UserSpeechComplete {
            interaction_id: "i1".to_string(),
            metadata: SpeechMetadata::default(),
        })
        .await;
    reducer
        .apply(ServerPacket::Audio {
            interaction_id: "i1".to_string(),
            seq: 0,
            payload: format::encode_payload(&[0.1, 0.2]),
        })
        .await;

    let record = reducer.latency().record("i1").unwrap();
    assert!(record.speech_complete_ms.is_some());
    assert!(record.first_audio_ms.is_some());
    assert!(record.derived_ms.is_some());

    // A second audio packet never recomputes the derived value
    let derived = record.derived_ms;
    reducer
        .apply(ServerPacket::Audio {
            interaction_id: "i1".to_string(),
            seq: 1,
            payload: format::encode_payload(&[0.3]),
        })
        .await;
    assert_eq!(reducer.latency().derived_ms("i1"), derived);
}

#[tokio::test]
async fn cancel_clears_the_queue_and_interrupts_the_bridge_once() {
    let (mut reducer, bridge, feed) = bridged_reducer().await;

    // Bridge not ready yet: the chunk lands in the local queue
    reducer
        .apply(ServerPacket::Audio {
            interaction_id: "i1".to_string(),
            seq: 0,
            payload: format::encode_payload(&[0.5; 160]),
        })
        .await;
    assert_eq!(reducer.output().local_queue().len(), 1);
    assert_eq!(bridge.audio_sends.load(Ordering::SeqCst), 0);

    feed.send(BridgeEvent::StreamReady {
        stream_id: "stream-1".to_string(),
    })
    .await
    .unwrap();
    settle().await;

    reducer
        .apply(ServerPacket::CancelResponse {
            interaction_id: "i1".to_string(),
        })
        .await;

    assert!(reducer.output().local_queue().is_empty());
    assert_eq!(bridge.interrupts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_is_ignored_when_auto_interrupt_is_disabled() {
    let (mut reducer, bridge) = local_only_reducer(false);

    reducer
        .apply(ServerPacket::Audio {
            interaction_id: "i1".to_string(),
            seq: 0,
            payload: format::encode_payload(&[0.5; 160]),
        })
        .await;
    reducer
        .apply(ServerPacket::CancelResponse {
            interaction_id: "i1".to_string(),
        })
        .await;

    assert_eq!(reducer.output().local_queue().len(), 1);
    assert_eq!(bridge.interrupts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn ready_bridge_receives_chunks_as_pcm16() {
    let (mut reducer, bridge, feed) = bridged_reducer().await;

    feed.send(BridgeEvent::StreamReady {
        stream_id: "stream-1".to_string(),
    })
    .await
    .unwrap();
    settle().await;

    reducer
        .apply(ServerPacket::Audio {
            interaction_id: "i1".to_string(),
            seq: 0,
            payload: format::encode_payload(&[0.5, -0.5]),
        })
        .await;

    assert_eq!(bridge.audio_sends.load(Ordering::SeqCst), 1);
    assert!(reducer.output().local_queue().is_empty());
}

#[tokio::test]
async fn failed_token_issuance_keeps_all_audio_local() {
    let (bridge, _feed) = StubBridge::with_feed();
    // Nothing listens on port 1; issuance fails fast
    let tokens = TokenClient::new("http://127.0.0.1:1", Some("cred".to_string()));
    let adapter = Arc::new(AvatarSessionAdapter::new(
        Arc::clone(&bridge) as Arc<dyn presence_gateway::avatar::AvatarBridge>,
        tokens,
    ));
    assert!(adapter.start("avatar-test", None).await.is_err());

    let output = AudioOutputRouter::new(adapter, PlaybackQueue::new());
    let mut reducer = ClientInteractionReducer::new(output, true);
    reducer
        .apply(ServerPacket::Audio {
            interaction_id: "i1".to_string(),
            seq: 0,
            payload: format::encode_payload(&[0.1; 160]),
        })
        .await;

    assert_eq!(reducer.output().local_queue().len(), 1);
    assert_eq!(bridge.audio_sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn gateway_error_stops_capture_and_surfaces_a_notice() {
    let (mut reducer, _bridge) = local_only_reducer(true);
    let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel();
    let (notices_tx, mut notices_rx) = mpsc::unbounded_channel();
    reducer.set_capture_control(ctl_tx);
    reducer.set_notices(notices_tx);

    reducer
        .apply(ServerPacket::Error {
            message: "pipeline unavailable".to_string(),
        })
        .await;

    assert_eq!(ctl_rx.recv().await, Some(CaptureCommand::Stop));
    assert_eq!(notices_rx.recv().await.unwrap(), "pipeline unavailable");
}

#[tokio::test]
async fn transport_close_stops_capture_and_clears_local_playback() {
    let (mut reducer, _bridge) = local_only_reducer(true);
    let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel();
    let (notices_tx, mut notices_rx) = mpsc::unbounded_channel();
    reducer.set_capture_control(ctl_tx);
    reducer.set_notices(notices_tx);

    reducer
        .apply(ServerPacket::Audio {
            interaction_id: "i1".to_string(),
            seq: 0,
            payload: format::encode_payload(&[0.5]),
        })
        .await;
    assert_eq!(reducer.output().local_queue().len(), 1);

    reducer.transport_closed();

    assert_eq!(ctl_rx.recv().await, Some(CaptureCommand::Stop));
    assert!(reducer.output().local_queue().is_empty());
    assert_eq!(notices_rx.recv().await.unwrap(), "session transport closed");
}

async fn next_packet(
    ws: &mut (impl StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
          + Unpin),
) -> ServerPacket {
    loop {
        match ws.next().await.expect("stream ended").expect("ws error") {
            Message::Text(text) => return ServerPacket::from_json(&text).expect("bad packet"),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => {}
        }
    }
}

#[tokio::test]
async fn binding_an_unknown_session_closes_with_a_distinct_code() {
    let registry = scripted_registry(ScriptedPipeline::new(), false);
    let addr = spawn_gateway(registry).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/sessions/ghost/stream"))
        .await
        .expect("connect");

    match ws.next().await.expect("no frame").expect("ws error") {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4404),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn a_second_transport_bind_is_refused() {
    let registry = scripted_registry(ScriptedPipeline::new(), false);
    registry
        .create(CreateSession {
            session_id: "s1".to_string(),
            voice_id: None,
            avatar_id: None,
            credential: None,
        })
        .await
        .unwrap();
    let addr = spawn_gateway(registry).await;

    let (_first, _) = connect_async(format!("ws://{addr}/sessions/s1/stream"))
        .await
        .expect("first connect");
    settle().await;

    let (mut second, _) = connect_async(format!("ws://{addr}/sessions/s1/stream"))
        .await
        .expect("second connect");
    match second.next().await.expect("no frame").expect("ws error") {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4409),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn destroying_a_session_closes_its_live_transport() {
    let registry = scripted_registry(ScriptedPipeline::new(), false);
    registry
        .create(CreateSession {
            session_id: "s1".to_string(),
            voice_id: None,
            avatar_id: None,
            credential: None,
        })
        .await
        .unwrap();
    let addr = spawn_gateway(Arc::clone(&registry)).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/sessions/s1/stream"))
        .await
        .expect("connect");
    settle().await;

    registry.unload("s1").await.unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    });
    closed.await.expect("transport stayed open after unload");
}

#[tokio::test]
async fn text_round_trip_preserves_causal_packet_order() {
    let pipeline = ScriptedPipeline::new();
    let registry = scripted_registry(Arc::clone(&pipeline), false);
    registry
        .create(CreateSession {
            session_id: "s1".to_string(),
            voice_id: None,
            avatar_id: None,
            credential: None,
        })
        .await
        .unwrap();
    let addr = spawn_gateway(Arc::clone(&registry)).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/sessions/s1/stream"))
        .await
        .expect("connect");

    let outbound = ClientPacket::Text {
        text: "ping".to_string(),
    }
    .to_json()
    .unwrap();
    ws.send(Message::Text(outbound.into())).await.unwrap();

    // NEW_INTERACTION arrives before anything referencing its id
    let ServerPacket::NewInteraction { interaction_id } = next_packet(&mut ws).await else {
        panic!("expected NEW_INTERACTION first");
    };

    let ServerPacket::Text {
        interaction_id: text_interaction,
        from_agent,
        text,
        is_final,
        ..
    } = next_packet(&mut ws).await
    else {
        panic!("expected TEXT second");
    };
    assert_eq!(text_interaction, interaction_id);
    assert!(from_agent);
    assert!(is_final);
    assert_eq!(text, "echo: ping");

    let ServerPacket::Audio {
        interaction_id: audio_interaction,
        seq,
        ..
    } = next_packet(&mut ws).await
    else {
        panic!("expected AUDIO third");
    };
    assert_eq!(audio_interaction, interaction_id);
    assert_eq!(seq, 0);

    let ServerPacket::InteractionEnd {
        interaction_id: end_interaction,
    } = next_packet(&mut ws).await
    else {
        panic!("expected INTERACTION_END last");
    };
    assert_eq!(end_interaction, interaction_id);

    // The finalized agent text was recorded into the session
    settle().await;
    let descriptor = registry.descriptor("s1").await.unwrap();
    assert_eq!(descriptor.message_count, 1);
}

#[tokio::test]
async fn typed_barge_in_cancels_the_open_interaction() {
    let pipeline = ScriptedPipeline::holding_open();
    let registry = scripted_registry(Arc::clone(&pipeline), false);
    registry
        .create(CreateSession {
            session_id: "s1".to_string(),
            voice_id: None,
            avatar_id: None,
            credential: None,
        })
        .await
        .unwrap();
    let addr = spawn_gateway(registry).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/sessions/s1/stream"))
        .await
        .expect("connect");

    let text = |t: &str| {
        Message::Text(
            ClientPacket::Text {
                text: t.to_string(),
            }
            .to_json()
            .unwrap()
            .into(),
        )
    };
    ws.send(text("first")).await.unwrap();

    // First turn: NEW_INTERACTION, TEXT, AUDIO — no INTERACTION_END, the
    // response is still in flight
    let ServerPacket::NewInteraction { interaction_id } = next_packet(&mut ws).await else {
        panic!("expected NEW_INTERACTION");
    };
    assert!(matches!(next_packet(&mut ws).await, ServerPacket::Text { .. }));
    assert!(matches!(next_packet(&mut ws).await, ServerPacket::Audio { .. }));

    ws.send(text("second")).await.unwrap();
    settle().await;

    assert_eq!(
        *pipeline.cancels.lock().await,
        vec![interaction_id.clone()]
    );

    // The cancel and the fresh interaction both come down; their relative
    // order across the two server tasks is not fixed
    let first = next_packet(&mut ws).await;
    let second = next_packet(&mut ws).await;
    let mut saw_cancel = false;
    let mut saw_new = false;
    for packet in [first, second] {
        match packet {
            ServerPacket::CancelResponse {
                interaction_id: cancelled,
            } => {
                assert_eq!(cancelled, interaction_id);
                saw_cancel = true;
            }
            ServerPacket::NewInteraction {
                interaction_id: next,
            } => {
                assert_ne!(next, interaction_id);
                saw_new = true;
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }
    assert!(saw_cancel && saw_new);
}

#[tokio::test]
async fn audio_uplink_reaches_the_pipeline_chunk_by_chunk() {
    let pipeline = ScriptedPipeline::new();
    let registry = scripted_registry(Arc::clone(&pipeline), false);
    registry
        .create(CreateSession {
            session_id: "s1".to_string(),
            voice_id: None,
            avatar_id: None,
            credential: None,
        })
        .await
        .unwrap();
    let addr = spawn_gateway(registry).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/sessions/s1/stream"))
        .await
        .expect("connect");

    let packet = ClientPacket::Audio {
        chunks: vec![
            format::encode_payload(&[0.1, 0.2]),
            "not base64!".to_string(),
            format::encode_payload(&[0.3]),
        ],
    };
    ws.send(Message::Text(packet.to_json().unwrap().into()))
        .await
        .unwrap();
    ws.send(Message::Text(
        ClientPacket::AudioSessionEnd.to_json().unwrap().into(),
    ))
    .await
    .unwrap();
    settle().await;

    // The malformed middle chunk was dropped; its neighbors survived
    let batches = pipeline.audio_batches.lock().await;
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0], vec![0.1, 0.2]);
    assert_eq!(batches[1], vec![0.3]);
    assert_eq!(pipeline.audio_ended.load(Ordering::SeqCst), 1);
}
