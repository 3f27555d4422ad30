//! Shared test utilities

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{Json, Router, routing::post};
use tokio::sync::{Mutex, mpsc};

use presence_gateway::api::ApiState;
use presence_gateway::avatar::{AvatarBridge, BridgeEvent, BridgeToken, TokenClient};
use presence_gateway::pipeline::{PipelineEvent, PipelineStream, SpeechPipeline};
use presence_gateway::session::{PipelineFactory, SessionRegistry};
use presence_gateway::{Error, Result};

/// Pipeline stub that echoes text input as a scripted agent response
///
/// `push_text` emits a final agent `Text`, one `Audio` chunk, and
/// `InteractionEnd` for the given interaction, mirroring the remote
/// pipeline's event order. Pushed audio batches are recorded for assertions.
pub struct ScriptedPipeline {
    pub audio_batches: Arc<Mutex<Vec<Vec<f32>>>>,
    pub audio_ended: Arc<AtomicUsize>,
    pub cancels: Arc<Mutex<Vec<String>>>,
    hold_open: bool,
}

impl ScriptedPipeline {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            audio_batches: Arc::new(Mutex::new(Vec::new())),
            audio_ended: Arc::new(AtomicUsize::new(0)),
            cancels: Arc::new(Mutex::new(Vec::new())),
            hold_open: false,
        })
    }

    /// A variant whose responses never close, for exercising cancellation
    #[must_use]
    pub fn holding_open() -> Arc<Self> {
        Arc::new(Self {
            audio_batches: Arc::new(Mutex::new(Vec::new())),
            audio_ended: Arc::new(AtomicUsize::new(0)),
            cancels: Arc::new(Mutex::new(Vec::new())),
            hold_open: true,
        })
    }
}

impl SpeechPipeline for ScriptedPipeline {
    fn open(&self, _session_id: &str) -> Box<dyn PipelineStream> {
        let (tx, rx) = mpsc::channel(32);
        Box::new(ScriptedStream {
            audio_batches: Arc::clone(&self.audio_batches),
            audio_ended: Arc::clone(&self.audio_ended),
            cancels: Arc::clone(&self.cancels),
            hold_open: self.hold_open,
            events_tx: tx,
            events_rx: Some(rx),
        })
    }
}

struct ScriptedStream {
    audio_batches: Arc<Mutex<Vec<Vec<f32>>>>,
    audio_ended: Arc<AtomicUsize>,
    cancels: Arc<Mutex<Vec<String>>>,
    hold_open: bool,
    events_tx: mpsc::Sender<PipelineEvent>,
    events_rx: Option<mpsc::Receiver<PipelineEvent>>,
}

#[async_trait]
impl PipelineStream for ScriptedStream {
    async fn push_audio(&mut self, samples: Vec<f32>) -> Result<()> {
        self.audio_batches.lock().await.push(samples);
        Ok(())
    }

    async fn push_text(&mut self, interaction_id: &str, text: &str) -> Result<()> {
        let mut events = vec![
            PipelineEvent::Text {
                interaction_id: interaction_id.to_string(),
                utterance_id: format!("{interaction_id}-reply"),
                from_agent: true,
                text: format!("echo: {text}"),
                is_final: true,
            },
            PipelineEvent::Audio {
                interaction_id: interaction_id.to_string(),
                seq: 0,
                samples: vec![0.25, -0.25],
            },
        ];
        if !self.hold_open {
            events.push(PipelineEvent::InteractionEnd {
                interaction_id: interaction_id.to_string(),
            });
        }
        for event in events {
            self.events_tx
                .send(event)
                .await
                .map_err(|_| Error::Pipeline("event consumer gone".to_string()))?;
        }
        Ok(())
    }

    async fn end_audio(&mut self) -> Result<()> {
        self.audio_ended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel(&mut self, interaction_id: &str) -> Result<()> {
        self.cancels.lock().await.push(interaction_id.to_string());
        self.events_tx
            .send(PipelineEvent::Cancelled {
                interaction_id: interaction_id.to_string(),
            })
            .await
            .map_err(|_| Error::Pipeline("event consumer gone".to_string()))?;
        Ok(())
    }

    fn events(&mut self) -> Option<mpsc::Receiver<PipelineEvent>> {
        self.events_rx.take()
    }
}

/// Avatar bridge stub whose event stream is fed by the test
pub struct StubBridge {
    events: Mutex<Option<mpsc::Receiver<BridgeEvent>>>,
    pub audio_sends: AtomicUsize,
    pub interrupts: AtomicUsize,
}

impl StubBridge {
    #[must_use]
    pub fn with_feed() -> (Arc<Self>, mpsc::Sender<BridgeEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let bridge = Arc::new(Self {
            events: Mutex::new(Some(rx)),
            audio_sends: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
        });
        (bridge, tx)
    }
}

#[async_trait]
impl AvatarBridge for StubBridge {
    async fn connect(&self, _token: &BridgeToken) -> Result<mpsc::Receiver<BridgeEvent>> {
        self.events
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Bridge("already connected".to_string()))
    }

    async fn send_audio(&self, _pcm16_le: &[u8]) -> Result<()> {
        self.audio_sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Start a minimal avatar token service and return a client pointed at it
pub async fn token_service_client() -> TokenClient {
    async fn issue() -> Json<serde_json::Value> {
        Json(serde_json::json!({ "token": "test-token" }))
    }
    async fn revoke() -> Json<serde_json::Value> {
        Json(serde_json::json!({}))
    }

    let app = Router::new()
        .route("/v1/tokens", post(issue))
        .route("/v1/tokens/revoke", post(revoke));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind token service");
    let addr = listener.local_addr().expect("token service addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TokenClient::new(&format!("http://{addr}"), Some("test-cred".to_string()))
}

/// Build a registry whose factory hands out one shared scripted pipeline
#[must_use]
pub fn scripted_registry(
    pipeline: Arc<ScriptedPipeline>,
    require_credential: bool,
) -> Arc<SessionRegistry> {
    let factory: PipelineFactory =
        Arc::new(move |_voice| Arc::clone(&pipeline) as Arc<dyn SpeechPipeline>);
    Arc::new(SessionRegistry::new(
        factory,
        "voice-test",
        "avatar-test",
        require_credential,
        None,
    ))
}

/// Start the gateway on an ephemeral port and return its bound address
pub async fn spawn_gateway(registry: Arc<SessionRegistry>) -> std::net::SocketAddr {
    let app = presence_gateway::api::router(Arc::new(ApiState { registry }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind gateway");
    let addr = listener.local_addr().expect("gateway addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Let spawned tasks settle; long enough to cover loopback TCP delayed-ACK
/// (~40ms) holding back a Nagle-buffered frame
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(120)).await;
}
