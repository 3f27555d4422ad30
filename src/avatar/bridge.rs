//! Bridge connection to the externally hosted avatar rendering stream
//!
//! The vendor transport sits behind [`AvatarBridge`] so the adapter's state
//! machine can be driven by any backend. All externally observed signals
//! (connection state, stream readiness, errors) arrive on one ordered event
//! channel per connection, so the consumer sees a single coherent order.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};

use super::token::BridgeToken;
use crate::{Error, Result};

/// Connection-level state reported by the external bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeConnState {
    /// The bridge connection is established
    Connected,
    /// The bridge connection is gone
    Disconnected,
}

/// An event observed from the external avatar bridge
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Connection state changed
    StateChanged(BridgeConnState),
    /// The rendering stream is ready to consume audio; carries the stream id
    StreamReady { stream_id: String },
    /// Bridge-side error; surfaced to the caller, does not itself change state
    Error { message: String },
}

/// Transport to an externally hosted avatar rendering session
#[async_trait]
pub trait AvatarBridge: Send + Sync {
    /// Open the bridge with an issued token and return its ordered event
    /// stream
    async fn connect(&self, token: &BridgeToken) -> Result<mpsc::Receiver<BridgeEvent>>;

    /// Forward signed 16-bit PCM (little-endian bytes) to the rendering stream
    async fn send_audio(&self, pcm16_le: &[u8]) -> Result<()>;

    /// Ask the rendering stream to stop speaking immediately
    async fn interrupt(&self) -> Result<()>;

    /// Close the bridge connection
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct StreamCreated {
    stream_id: String,
    #[serde(default)]
    ready: bool,
}

/// Default bridge over the avatar service's REST surface
pub struct RestAvatarBridge {
    client: reqwest::Client,
    base_url: String,
    stream_id: Mutex<Option<String>>,
    events: Mutex<Option<mpsc::Sender<BridgeEvent>>>,
}

impl RestAvatarBridge {
    /// Create a bridge for the avatar service at `base_url`
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            stream_id: Mutex::new(None),
            events: Mutex::new(None),
        }
    }

    async fn current_stream(&self) -> Result<String> {
        self.stream_id
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Bridge("bridge not connected".to_string()))
    }
}

#[async_trait]
impl AvatarBridge for RestAvatarBridge {
    async fn connect(&self, token: &BridgeToken) -> Result<mpsc::Receiver<BridgeEvent>> {
        let response = self
            .client
            .post(format!("{}/v1/streams", self.base_url))
            .bearer_auth(&token.token)
            .send()
            .await
            .map_err(|e| Error::Bridge(format!("stream open failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Bridge(format!("stream open failed {status}: {body}")));
        }

        let created: StreamCreated = response
            .json()
            .await
            .map_err(|e| Error::Bridge(format!("malformed stream response: {e}")))?;

        let (tx, rx) = mpsc::channel(16);
        let _ = tx.send(BridgeEvent::StateChanged(BridgeConnState::Connected)).await;
        if created.ready {
            let _ = tx
                .send(BridgeEvent::StreamReady {
                    stream_id: created.stream_id.clone(),
                })
                .await;
        }

        tracing::info!(stream_id = %created.stream_id, "avatar bridge connected");
        *self.stream_id.lock().await = Some(created.stream_id);
        *self.events.lock().await = Some(tx);
        Ok(rx)
    }

    async fn send_audio(&self, pcm16_le: &[u8]) -> Result<()> {
        let stream_id = self.current_stream().await?;
        let response = self
            .client
            .post(format!("{}/v1/streams/{stream_id}/audio", self.base_url))
            .header("Content-Type", "application/octet-stream")
            .body(pcm16_le.to_vec())
            .send()
            .await
            .map_err(|e| Error::Bridge(format!("audio forward failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Bridge(format!(
                "audio forward failed: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        let stream_id = self.current_stream().await?;
        let response = self
            .client
            .post(format!("{}/v1/streams/{stream_id}/interrupt", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Bridge(format!("interrupt failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Bridge(format!(
                "interrupt failed: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(stream_id) = self.stream_id.lock().await.take() else {
            return Ok(());
        };

        if let Some(events) = self.events.lock().await.take() {
            let _ = events
                .send(BridgeEvent::StateChanged(BridgeConnState::Disconnected))
                .await;
        }

        let response = self
            .client
            .delete(format!("{}/v1/streams/{stream_id}", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Bridge(format!("stream close failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Bridge(format!(
                "stream close failed: {}",
                response.status()
            )));
        }

        tracing::info!(stream_id = %stream_id, "avatar bridge closed");
        Ok(())
    }
}
