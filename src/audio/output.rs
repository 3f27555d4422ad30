//! Audio output routing between the avatar bridge and local playback
//!
//! Every synthesized chunk is routed independently: bridge readiness is read
//! at the moment of use, so a bridge that becomes ready mid-interaction picks
//! up subsequent chunks while earlier chunks stay in the local queue.

use std::sync::Arc;

use super::format;
use super::playback::PlaybackQueue;
use crate::Result;
use crate::avatar::AvatarSessionAdapter;

/// Where a chunk ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Forwarded to the avatar bridge as 16-bit PCM
    Bridge,
    /// Enqueued for local sequential playback
    Local,
}

/// Routes each audio payload to the avatar bridge or the local queue
pub struct AudioOutputRouter {
    avatar: Arc<AvatarSessionAdapter>,
    local: PlaybackQueue,
}

impl AudioOutputRouter {
    /// Create a router over an avatar adapter and a local queue
    #[must_use]
    pub fn new(avatar: Arc<AvatarSessionAdapter>, local: PlaybackQueue) -> Self {
        Self { avatar, local }
    }

    /// Route one base64 f32 PCM payload
    ///
    /// A ready bridge receives the chunk converted to 16-bit PCM; a forward
    /// failure falls back to local playback for that chunk rather than
    /// dropping it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Format` for an undecodable payload; the caller drops
    /// the chunk and continues with the next one
    pub async fn route(&self, payload: &str) -> Result<Route> {
        let samples = format::decode_payload(payload)?;

        if self.avatar.is_stream_ready() {
            let pcm16 = format::f32_to_i16(&samples);
            match self.avatar.forward_audio(&pcm16).await {
                Ok(()) => return Ok(Route::Bridge),
                Err(e) => {
                    tracing::warn!(error = %e, "bridge forward failed, falling back to local playback");
                }
            }
        }

        self.local.enqueue(samples);
        Ok(Route::Local)
    }

    /// Cancel all in-flight output: clear the local queue immediately and,
    /// when the bridge stream is ready, interrupt it exactly once.
    /// An interrupt failure is logged; local cancellation has already
    /// happened.
    pub async fn cancel(&self) {
        self.local.clear();

        if self.avatar.is_stream_ready() {
            if let Err(e) = self.avatar.interrupt().await {
                tracing::warn!(error = %e, "avatar interrupt failed");
            }
        }
    }

    /// The local playback queue
    #[must_use]
    pub fn local_queue(&self) -> &PlaybackQueue {
        &self.local
    }

    /// The avatar adapter consulted for routing
    #[must_use]
    pub fn avatar(&self) -> &Arc<AvatarSessionAdapter> {
        &self.avatar
    }
}
