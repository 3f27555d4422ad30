//! Wire protocol for the persistent session transport
//!
//! One JSON object per message, discriminated by `type`. Both directions are
//! closed tagged unions — a packet with an unknown `type` is a decode error,
//! never silently ignored.

use serde::{Deserialize, Serialize};

use crate::Result;

/// Packets sent from the client up to the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientPacket {
    /// Captured microphone audio, one or more base64 chunks of f32-LE PCM
    #[serde(rename = "audio")]
    Audio { chunks: Vec<String> },

    /// Typed user input (trimmed before sending)
    #[serde(rename = "text")]
    Text { text: String },

    /// Explicit end of the audio capture session
    #[serde(rename = "audioSessionEnd")]
    AudioSessionEnd,
}

/// Packets emitted by the gateway down to the client
///
/// Packets for a given interaction are emitted in causal order:
/// `NEW_INTERACTION` precedes any `TEXT`/`AUDIO`/`INTERACTION_END`
/// referencing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerPacket {
    /// A synthesized audio payload (base64 f32-LE PCM) with a sequence marker
    #[serde(rename = "AUDIO")]
    Audio {
        interaction_id: String,
        seq: u32,
        payload: String,
    },

    /// Opens a new interaction
    #[serde(rename = "NEW_INTERACTION")]
    NewInteraction { interaction_id: String },

    /// Partial-or-final transcript/response text
    #[serde(rename = "TEXT")]
    Text {
        interaction_id: String,
        utterance_id: String,
        from_agent: bool,
        text: String,
        is_final: bool,
    },

    /// VAD-detected end of user speech
    #[serde(rename = "USER_SPEECH_COMPLETE")]
    UserSpeechComplete {
        interaction_id: String,
        #[serde(default)]
        metadata: SpeechMetadata,
    },

    /// Abort the current agent response
    #[serde(rename = "CANCEL_RESPONSE")]
    CancelResponse { interaction_id: String },

    /// Closes an interaction
    #[serde(rename = "INTERACTION_END")]
    InteractionEnd { interaction_id: String },

    /// Human-readable error notice
    #[serde(rename = "ERROR")]
    Error { message: String },
}

/// Diagnostic metadata attached to a speech-complete signal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeechMetadata {
    /// Upstream latency hint from the recognition service, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_hint_ms: Option<u64>,

    /// VAD confidence for the end-of-speech decision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vad_score: Option<f32>,
}

impl ClientPacket {
    /// Decode a client packet from its JSON wire form
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` for malformed JSON or an unknown `type`
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode this packet to its JSON wire form
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerPacket {
    /// Decode a server packet from its JSON wire form
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` for malformed JSON or an unknown `type`
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode this packet to its JSON wire form
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Interaction id carried by this packet, if any
    #[must_use]
    pub fn interaction_id(&self) -> Option<&str> {
        match self {
            Self::Audio { interaction_id, .. }
            | Self::NewInteraction { interaction_id }
            | Self::Text { interaction_id, .. }
            | Self::UserSpeechComplete { interaction_id, .. }
            | Self::CancelResponse { interaction_id }
            | Self::InteractionEnd { interaction_id } => Some(interaction_id),
            Self::Error { .. } => None,
        }
    }
}
