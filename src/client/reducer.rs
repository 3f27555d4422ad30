//! Client-side interaction state reducer
//!
//! Consumes the ordered packet stream and maintains the turn-indexed chat
//! history with partial→final reconciliation, driving the audio output
//! router and latency tracker as a side effect. History ordering is
//! insertion order with in-place replacement on finalization — never
//! re-sorted.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::audio::AudioOutputRouter;
use crate::latency::LatencyTracker;
use crate::protocol::ServerPacket;

/// Who produced an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    User,
    Agent,
}

impl Origin {
    const fn from_agent(from_agent: bool) -> Self {
        if from_agent { Self::Agent } else { Self::User }
    }
}

/// One utterance in the visible chat history
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Stable identifier
    pub id: String,
    /// Interaction the utterance belongs to
    pub interaction_id: String,
    pub origin: Origin,
    /// Display text, mutated in place while still being recognized
    pub text: String,
    /// True while the recognition result may still change
    pub recognizing: bool,
    pub timestamp: DateTime<Utc>,
}

/// Visible chat history entry
#[derive(Debug, Clone)]
pub enum ChatHistoryItem {
    Utterance(Utterance),
    /// Terminal boundary closing an interaction
    InteractionBoundary {
        interaction_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// Commands sent to the owner of the capture uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommand {
    /// Stop capture and release the audio source
    Stop,
}

/// Consumes the ordered packet stream and maintains chat history plus live
/// interaction bookkeeping
pub struct ClientInteractionReducer {
    history: Vec<ChatHistoryItem>,
    current_interaction: Option<String>,
    output: AudioOutputRouter,
    latency: LatencyTracker,
    auto_interrupt: bool,
    capture_ctl: Option<mpsc::UnboundedSender<CaptureCommand>>,
    notices: Option<mpsc::UnboundedSender<String>>,
}

impl ClientInteractionReducer {
    /// Create a reducer over an output router
    #[must_use]
    pub fn new(output: AudioOutputRouter, auto_interrupt: bool) -> Self {
        Self {
            history: Vec::new(),
            current_interaction: None,
            output,
            latency: LatencyTracker::new(),
            auto_interrupt,
            capture_ctl: None,
            notices: None,
        }
    }

    /// Route capture-stop commands to the capture owner
    pub fn set_capture_control(&mut self, ctl: mpsc::UnboundedSender<CaptureCommand>) {
        self.capture_ctl = Some(ctl);
    }

    /// Route user-visible notices to the caller
    pub fn set_notices(&mut self, notices: mpsc::UnboundedSender<String>) {
        self.notices = Some(notices);
    }

    /// Apply one packet in arrival order
    ///
    /// Mid-session failures (bridge forwarding, malformed audio) are
    /// recovered here: logged, the offending chunk dropped, processing
    /// continues.
    pub async fn apply(&mut self, packet: ServerPacket) {
        match packet {
            ServerPacket::NewInteraction { interaction_id } => {
                tracing::debug!(interaction_id = %interaction_id, "interaction opened");
                self.current_interaction = Some(interaction_id);
            }
            ServerPacket::Text {
                interaction_id,
                utterance_id,
                from_agent,
                text,
                is_final,
            } => {
                self.apply_text(&interaction_id, &utterance_id, from_agent, text, is_final);
            }
            ServerPacket::UserSpeechComplete {
                interaction_id,
                metadata,
            } => {
                self.latency.note_speech_complete(&interaction_id, &metadata);
            }
            ServerPacket::Audio {
                interaction_id,
                seq,
                payload,
            } => {
                self.latency.note_first_audio(&interaction_id);
                match self.output.route(&payload).await {
                    Ok(route) => {
                        tracing::trace!(interaction_id = %interaction_id, seq, ?route, "audio routed");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, seq, "dropping undecodable audio chunk");
                    }
                }
            }
            ServerPacket::CancelResponse { interaction_id } => {
                if self.auto_interrupt {
                    tracing::debug!(interaction_id = %interaction_id, "cancelling response output");
                    self.output.cancel().await;
                } else {
                    tracing::debug!(interaction_id = %interaction_id, "auto interrupt disabled, ignoring cancel");
                }
            }
            ServerPacket::InteractionEnd { interaction_id } => {
                self.history.push(ChatHistoryItem::InteractionBoundary {
                    interaction_id: interaction_id.clone(),
                    timestamp: Utc::now(),
                });
                if self.current_interaction.as_deref() == Some(&interaction_id) {
                    self.current_interaction = None;
                }
            }
            ServerPacket::Error { message } => {
                tracing::error!(message = %message, "gateway reported error");
                if let Some(ctl) = &self.capture_ctl {
                    let _ = ctl.send(CaptureCommand::Stop);
                }
                if let Some(notices) = &self.notices {
                    let _ = notices.send(message);
                }
            }
        }
    }

    /// The packet stream is gone: stop capture, drop queued playback, and
    /// surface a user-visible notice
    pub fn transport_closed(&mut self) {
        if let Some(ctl) = &self.capture_ctl {
            let _ = ctl.send(CaptureCommand::Stop);
        }
        self.output.local_queue().clear();
        if let Some(notices) = &self.notices {
            let _ = notices.send("session transport closed".to_string());
        }
    }

    fn apply_text(
        &mut self,
        interaction_id: &str,
        utterance_id: &str,
        from_agent: bool,
        text: String,
        is_final: bool,
    ) {
        let origin = Origin::from_agent(from_agent);

        // Transcription-noise filter: an empty user utterance never mutates
        // history; agent text is never discarded for emptiness
        if origin == Origin::User && text.trim().is_empty() {
            tracing::trace!(interaction_id, "discarding empty user text");
            return;
        }

        let display = if origin == Origin::User && is_final {
            normalize_user_text(&text)
        } else {
            text
        };

        if is_final && origin == Origin::User {
            self.latency.note_user_text(interaction_id, &display);
        }

        if is_final {
            self.reconcile_final(interaction_id, utterance_id, origin, display);
        } else {
            self.reconcile_partial(interaction_id, utterance_id, origin, display);
        }
    }

    /// Find the still-recognizing utterance for (interaction, origin),
    /// scanning back only as far as that interaction's closing boundary — a
    /// closed interaction's items belong to an unrelated, finished exchange.
    fn find_recognizing(&mut self, interaction_id: &str, origin: Origin) -> Option<&mut Utterance> {
        for item in self.history.iter_mut().rev() {
            match item {
                ChatHistoryItem::InteractionBoundary {
                    interaction_id: closed,
                    ..
                } if closed == interaction_id => return None,
                ChatHistoryItem::Utterance(utterance)
                    if utterance.interaction_id == interaction_id
                        && utterance.origin == origin
                        && utterance.recognizing =>
                {
                    return Some(utterance);
                }
                _ => {}
            }
        }
        None
    }

    fn reconcile_partial(
        &mut self,
        interaction_id: &str,
        utterance_id: &str,
        origin: Origin,
        text: String,
    ) {
        if let Some(existing) = self.find_recognizing(interaction_id, origin) {
            existing.text = text;
            return;
        }
        self.history.push(ChatHistoryItem::Utterance(Utterance {
            id: utterance_id.to_string(),
            interaction_id: interaction_id.to_string(),
            origin,
            text,
            recognizing: true,
            timestamp: Utc::now(),
        }));
    }

    fn reconcile_final(
        &mut self,
        interaction_id: &str,
        utterance_id: &str,
        origin: Origin,
        text: String,
    ) {
        // Replace the in-progress item first so finalization never leaves a
        // duplicate partial behind
        if let Some(existing) = self.find_recognizing(interaction_id, origin) {
            existing.id = utterance_id.to_string();
            existing.text = text;
            existing.recognizing = false;
            existing.timestamp = Utc::now();
            return;
        }

        // Then by stable identifier
        for item in self.history.iter_mut().rev() {
            if let ChatHistoryItem::Utterance(utterance) = item {
                if utterance.id == utterance_id {
                    utterance.text = text;
                    utterance.recognizing = false;
                    return;
                }
            }
        }

        self.history.push(ChatHistoryItem::Utterance(Utterance {
            id: utterance_id.to_string(),
            interaction_id: interaction_id.to_string(),
            origin,
            text,
            recognizing: false,
            timestamp: Utc::now(),
        }));
    }

    /// The visible chat history in insertion order
    #[must_use]
    pub fn history(&self) -> &[ChatHistoryItem] {
        &self.history
    }

    /// Utterances only, skipping boundary markers
    pub fn utterances(&self) -> impl Iterator<Item = &Utterance> {
        self.history.iter().filter_map(|item| match item {
            ChatHistoryItem::Utterance(utterance) => Some(utterance),
            ChatHistoryItem::InteractionBoundary { .. } => None,
        })
    }

    /// Interaction currently open, if any
    #[must_use]
    pub fn current_interaction(&self) -> Option<&str> {
        self.current_interaction.as_deref()
    }

    /// Latency measurements observed so far
    #[must_use]
    pub fn latency(&self) -> &LatencyTracker {
        &self.latency
    }

    /// The output router this reducer drives
    #[must_use]
    pub fn output(&self) -> &AudioOutputRouter {
        &self.output
    }
}

/// Normalize final user text for display: uppercase the first character and
/// append a terminal punctuation mark when the text lacks one
#[must_use]
pub fn normalize_user_text(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let mut chars = trimmed.chars();
    let first = chars.next().map(|c| c.to_uppercase().collect::<String>());
    let mut normalized = first.unwrap_or_default();
    normalized.push_str(chars.as_str());

    if !normalized.ends_with(['.', '!', '?']) {
        normalized.push('.');
    }
    normalized
}
