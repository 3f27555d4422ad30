//! Client-side session coordination
//!
//! Ties the transport, reducer, capture uplink, avatar adapter, and local
//! playback together for one live session.

pub mod reducer;
pub mod transport;

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;

pub use reducer::{CaptureCommand, ChatHistoryItem, ClientInteractionReducer, Origin, Utterance};
pub use transport::{BIND_DELAY, SessionTransport};

use crate::audio::{AudioOutputRouter, CaptureUplink, PlaybackQueue, playback};
use crate::avatar::{AvatarSessionAdapter, RestAvatarBridge, TokenClient};
use crate::config::Config;
use crate::session::CreateSession;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct CreatedDescriptor {
    avatar_id: String,
}

/// A running client session
pub struct SessionClient {
    session_id: String,
    gateway_url: String,
    http: reqwest::Client,
    capture: CaptureUplink,
    reducer_loop: tokio::task::JoinHandle<()>,
    capture_ctl_rx: mpsc::UnboundedReceiver<CaptureCommand>,
    /// User-visible notices (transport failures, gateway errors)
    pub notices: mpsc::UnboundedReceiver<String>,
    avatar: Arc<AvatarSessionAdapter>,
    playback: PlaybackQueue,
    playback_drain: Option<tokio::task::JoinHandle<()>>,
}

impl SessionClient {
    /// Create the session on the gateway, bind its transport, and start the
    /// coordination loops
    ///
    /// A failed avatar start downgrades to local-only playback; it never
    /// fails the session.
    ///
    /// # Errors
    ///
    /// Returns error when session creation or the transport bind fails
    #[allow(clippy::future_not_send)]
    pub async fn start(config: &Config, session_id: &str, headless: bool) -> Result<Self> {
        let gateway_url = format!("http://127.0.0.1:{}", config.server.port);
        let http = reqwest::Client::new();

        let response = http
            .post(format!("{gateway_url}/sessions"))
            .json(&CreateSession {
                session_id: session_id.to_string(),
                voice_id: None,
                avatar_id: None,
                credential: None,
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "session create failed {status}: {body}"
            )));
        }
        let descriptor: CreatedDescriptor = response.json().await?;

        let ws_url = format!("ws://127.0.0.1:{}", config.server.port);
        let transport = transport::connect_after_create(&ws_url, session_id).await?;
        let mut inbound = transport.inbound;

        // Avatar bridge: best-effort; Scenario — token issuance failure
        // leaves all audio routed locally
        let tokens = TokenClient::new(
            &config.avatar.base_url,
            config.avatar.default_credential.clone(),
        );
        let bridge = Arc::new(RestAvatarBridge::new(&config.avatar.base_url));
        let avatar = Arc::new(AvatarSessionAdapter::new(bridge, tokens));
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        avatar.set_notices(notices_tx.clone());
        if let Err(e) = avatar.start(&descriptor.avatar_id, None).await {
            tracing::warn!(error = %e, "avatar unavailable, continuing with local playback only");
        }

        let queue = PlaybackQueue::new();
        let playback_drain = if headless {
            None
        } else {
            Some(playback::spawn_drain(
                queue.clone(),
                config.audio.sample_rate,
            ))
        };

        let output = AudioOutputRouter::new(Arc::clone(&avatar), queue.clone());
        let mut reducer = ClientInteractionReducer::new(output, config.avatar.auto_interrupt);
        let (capture_ctl_tx, capture_ctl_rx) = mpsc::unbounded_channel();
        reducer.set_capture_control(capture_ctl_tx);
        reducer.set_notices(notices_tx);

        let reducer_loop = tokio::spawn(async move {
            while let Some(packet) = inbound.recv().await {
                reducer.apply(packet).await;
            }
            tracing::info!("packet stream ended");
            reducer.transport_closed();
        });

        let mut capture = CaptureUplink::new(
            transport.outbound,
            config.audio.batch_interval(),
            config.audio.sample_rate,
        );
        if headless {
            capture = capture.without_device();
        }

        Ok(Self {
            session_id: session_id.to_string(),
            gateway_url,
            http,
            capture,
            reducer_loop,
            capture_ctl_rx,
            notices: notices_rx,
            avatar,
            playback: queue,
            playback_drain,
        })
    }

    /// Begin streaming microphone audio to the gateway
    ///
    /// # Errors
    ///
    /// Returns error when the transport is closed or the device is
    /// unavailable
    pub fn start_capture(&mut self) -> Result<()> {
        self.capture.start()
    }

    /// Stop streaming microphone audio
    pub fn stop_capture(&mut self) {
        self.capture.stop();
    }

    /// Service pending capture-stop commands issued by the reducer
    pub fn poll_capture_commands(&mut self) {
        while let Ok(command) = self.capture_ctl_rx.try_recv() {
            match command {
                CaptureCommand::Stop => self.capture.stop(),
            }
        }
    }

    /// Whether the packet stream is still live
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.reducer_loop.is_finished()
    }

    /// Tear down the session: stop capture and the avatar bridge, then ask
    /// the gateway to unload
    #[allow(clippy::future_not_send)]
    pub async fn shutdown(mut self) {
        self.capture.stop();
        self.avatar.stop().await;
        self.reducer_loop.abort();
        // Closing before clearing guarantees the drain worker neither picks
        // up another chunk nor finishes the one in flight
        self.playback.close();
        self.playback.clear();
        if let Some(drain) = self.playback_drain.take() {
            let _ = drain.await;
        }

        let destroy = self
            .http
            .delete(format!("{}/sessions/{}", self.gateway_url, self.session_id))
            .send()
            .await;
        if let Err(e) = destroy {
            tracing::warn!(error = %e, "session destroy request failed");
        }
    }
}
