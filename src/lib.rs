//! Presence Gateway - Turn-based conversational session coordinator
//!
//! This library provides the core functionality for the Presence gateway:
//! - Ordered interaction event protocol over a persistent transport
//! - Microphone capture uplink at a fixed batching cadence
//! - Audio output routing between an avatar bridge and local playback
//! - Avatar session lifecycle (tokens, stream readiness, teardown)
//! - Server-side session registry with shared per-voice pipeline handles
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Client                           │
//! │  Capture  │  Reducer  │  Output Router  │  Avatar   │
//! └────────────────────┬────────────────────────────────┘
//!                      │ persistent transport (packets)
//! ┌────────────────────▼────────────────────────────────┐
//! │               Presence Gateway                       │
//! │  Sessions  │  Event Router  │  Pipeline Handles     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │          Hosted Speech Pipeline                      │
//! │   Recognition  │  Generation  │  Synthesis          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod audio;
pub mod avatar;
pub mod client;
pub mod config;
pub mod error;
pub mod latency;
pub mod pipeline;
pub mod protocol;
pub mod session;

pub use audio::{AudioOutputRouter, CaptureUplink, PlaybackQueue, Route};
pub use avatar::{AvatarSessionAdapter, AvatarState, VideoSink};
pub use client::SessionClient;
pub use client::reducer::{ChatHistoryItem, ClientInteractionReducer, Origin, Utterance};
pub use config::Config;
pub use error::{Error, Result};
pub use latency::{LatencyRecord, LatencyTracker};
pub use pipeline::{PipelineEvent, PipelineStream, RemotePipeline, SpeechPipeline};
pub use protocol::{ClientPacket, ServerPacket, SpeechMetadata};
pub use session::{AgentDescriptor, CreateSession, SessionRegistry, StoredMessage};
