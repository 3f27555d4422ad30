//! Avatar session lifecycle adapter
//!
//! Owns the external avatar rendering connection: token exchange, connect,
//! stream-ready tracking, teardown. State transitions are driven only by
//! events observed from the bridge, delivered on one ordered channel, never
//! set directly by other components. Readers always see the current state
//! through [`AvatarSessionAdapter::is_stream_ready`] rather than a captured
//! snapshot, because bridge events arrive asynchronously relative to the
//! packet stream.

pub mod bridge;
pub mod token;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;

pub use bridge::{AvatarBridge, BridgeConnState, BridgeEvent, RestAvatarBridge};
pub use token::{BridgeToken, TokenClient};

use crate::{Error, Result};

/// Lifecycle state of the avatar rendering connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvatarState {
    /// Token issued, bridge connection being opened
    Connecting,
    /// Bridge connection established
    Connected,
    /// Rendering stream ready to consume audio
    StreamReady,
    /// No live bridge connection
    Disconnected,
}

/// Output binding for the rendered avatar stream
pub trait VideoSink: Send + Sync {
    /// Bind the sink to a ready rendering stream
    fn bind_stream(&self, stream_id: &str);
}

/// Shared adapter state, read at the point of use by all consumers
struct AdapterShared {
    state: Mutex<AvatarState>,
    stream_ready: AtomicBool,
    stream_id: Mutex<Option<String>>,
    sink: Mutex<Option<Box<dyn VideoSink>>>,
    notices: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl AdapterShared {
    fn set_state(&self, state: AvatarState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn handle_event(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::StateChanged(BridgeConnState::Connected) => {
                tracing::debug!("avatar bridge reported connected");
                self.set_state(AvatarState::Connected);
            }
            BridgeEvent::StreamReady { stream_id } => {
                tracing::info!(stream_id = %stream_id, "avatar stream ready");
                self.set_state(AvatarState::StreamReady);
                self.stream_ready.store(true, Ordering::SeqCst);
                if let Ok(mut current) = self.stream_id.lock() {
                    *current = Some(stream_id.clone());
                }
                // A deferred attach binds now
                if let Ok(sink) = self.sink.lock() {
                    if let Some(sink) = sink.as_ref() {
                        sink.bind_stream(&stream_id);
                    }
                }
            }
            BridgeEvent::StateChanged(BridgeConnState::Disconnected) => {
                tracing::info!("avatar bridge disconnected");
                self.set_state(AvatarState::Disconnected);
                self.stream_ready.store(false, Ordering::SeqCst);
                self.detach();
            }
            BridgeEvent::Error { message } => {
                // Surfaced to the caller; does not itself change state
                tracing::warn!(message = %message, "avatar bridge error");
                if let Ok(notices) = self.notices.lock() {
                    if let Some(notices) = notices.as_ref() {
                        let _ = notices.send(message);
                    }
                }
            }
        }
    }

    /// Detach the video sink. Idempotent: detaching twice is harmless.
    fn detach(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            sink.take();
        }
        if let Ok(mut stream_id) = self.stream_id.lock() {
            stream_id.take();
        }
    }
}

/// Owns the lifecycle of the external avatar rendering connection and exposes
/// a uniform push/interrupt interface to it
pub struct AvatarSessionAdapter {
    shared: Arc<AdapterShared>,
    started: AtomicBool,
    bridge: Arc<dyn AvatarBridge>,
    tokens: TokenClient,
    token: AsyncMutex<Option<BridgeToken>>,
    pump: AsyncMutex<Option<JoinHandle<()>>>,
}

impl AvatarSessionAdapter {
    /// Create an adapter over a bridge transport and token client
    #[must_use]
    pub fn new(bridge: Arc<dyn AvatarBridge>, tokens: TokenClient) -> Self {
        Self {
            shared: Arc::new(AdapterShared {
                state: Mutex::new(AvatarState::Disconnected),
                stream_ready: AtomicBool::new(false),
                stream_id: Mutex::new(None),
                sink: Mutex::new(None),
                notices: Mutex::new(None),
            }),
            started: AtomicBool::new(false),
            bridge,
            tokens,
            token: AsyncMutex::new(None),
            pump: AsyncMutex::new(None),
        }
    }

    /// Route bridge error notices to a channel the caller drains
    pub fn set_notices(&self, notices: mpsc::UnboundedSender<String>) {
        if let Ok(mut current) = self.shared.notices.lock() {
            *current = Some(notices);
        }
    }

    /// Start the avatar session: issue a token, open the bridge, begin
    /// consuming its event stream
    ///
    /// # Errors
    ///
    /// Returns `Error::Bridge` when already started without an intervening
    /// [`stop`](Self::stop), when token issuance fails (the adapter never
    /// enters `Connecting` in that case), or when the bridge cannot connect
    pub async fn start(&self, avatar_id: &str, credential: Option<&str>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Bridge(
                "avatar adapter already started".to_string(),
            ));
        }

        // Token first: a failed exchange leaves the adapter fully stopped
        let token = match self.tokens.issue(avatar_id, credential).await {
            Ok(token) => token,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        self.shared.set_state(AvatarState::Connecting);

        let mut events = match self.bridge.connect(&token).await {
            Ok(events) => events,
            Err(e) => {
                self.shared.set_state(AvatarState::Disconnected);
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        *self.token.lock().await = Some(token);

        let shared = Arc::clone(&self.shared);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                shared.handle_event(event);
            }
        });
        *self.pump.lock().await = Some(pump);

        Ok(())
    }

    /// Attach an output sink
    ///
    /// Binds immediately when the stream is ready; otherwise the attach is
    /// deferred until readiness, not an error.
    pub fn attach(&self, sink: Box<dyn VideoSink>) {
        let ready_stream = self
            .shared
            .stream_id
            .lock()
            .ok()
            .and_then(|id| id.clone())
            .filter(|_| self.is_stream_ready());
        if let Some(stream_id) = ready_stream {
            sink.bind_stream(&stream_id);
        }
        if let Ok(mut current) = self.shared.sink.lock() {
            *current = Some(sink);
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> AvatarState {
        self.shared
            .state
            .lock()
            .map_or(AvatarState::Disconnected, |state| *state)
    }

    /// Whether the rendering stream is ready right now
    #[must_use]
    pub fn is_stream_ready(&self) -> bool {
        self.shared.stream_ready.load(Ordering::SeqCst)
    }

    /// Forward signed 16-bit PCM to the rendering stream
    ///
    /// # Errors
    ///
    /// Returns `Error::Bridge` when the stream is not ready or the forward
    /// fails; callers fall back to local playback for that chunk
    pub async fn forward_audio(&self, pcm16: &[i16]) -> Result<()> {
        if !self.is_stream_ready() {
            return Err(Error::Bridge("avatar stream not ready".to_string()));
        }
        let bytes = crate::audio::format::encode_i16_le(pcm16);
        self.bridge.send_audio(&bytes).await
    }

    /// Ask the rendering stream to stop speaking immediately
    ///
    /// # Errors
    ///
    /// Returns `Error::Bridge` on transport failure
    pub async fn interrupt(&self) -> Result<()> {
        self.bridge.interrupt().await
    }

    /// Tear down the avatar session
    ///
    /// Safe to call when never started and safe to call twice; both leave the
    /// state `Disconnected` with listeners detached. Token revocation failure
    /// is logged, never fatal — local teardown proceeds regardless.
    pub async fn stop(&self) {
        let was_started = self.started.swap(false, Ordering::SeqCst);

        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }

        if was_started {
            if let Err(e) = self.bridge.close().await {
                tracing::warn!(error = %e, "avatar bridge close failed");
            }
        }

        if let Some(token) = self.token.lock().await.take() {
            if let Err(e) = self.tokens.revoke(&token).await {
                tracing::warn!(error = %e, "bridge token revocation failed");
            }
        }

        self.shared.set_state(AvatarState::Disconnected);
        self.shared.stream_ready.store(false, Ordering::SeqCst);
        self.shared.detach();
    }
}
