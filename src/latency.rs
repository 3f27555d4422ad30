//! Per-interaction latency correlation
//!
//! Correlates asynchronous timestamp signals (end of user speech, final user
//! text arrival, first synthesized audio) into one latency measurement per
//! interaction. Signals arrive out of order relative to each other; the
//! derived value is computed once and never recomputed.

use std::collections::HashMap;

use crate::protocol::SpeechMetadata;

/// Accumulated timestamps and derived latency for one interaction
#[derive(Debug, Clone, Default)]
pub struct LatencyRecord {
    /// When the VAD reported end of user speech (epoch ms)
    pub speech_complete_ms: Option<i64>,

    /// When the final user transcript arrived (epoch ms)
    pub user_text_ms: Option<i64>,

    /// When the first synthesized audio chunk arrived (epoch ms)
    pub first_audio_ms: Option<i64>,

    /// Recognized user input text for this interaction
    pub input_text: Option<String>,

    /// Upstream latency hint reported by the recognition service
    pub upstream_hint_ms: Option<u64>,

    /// Derived response latency in milliseconds, set at most once
    pub derived_ms: Option<u64>,
}

impl LatencyRecord {
    /// Derive the latency once both a start timestamp and the first-audio
    /// timestamp are present. Idempotent: a value already set is never
    /// recomputed.
    fn try_derive(&mut self) {
        if self.derived_ms.is_some() {
            return;
        }
        let Some(first_audio) = self.first_audio_ms else {
            return;
        };
        let Some(start) = self.speech_complete_ms.or(self.user_text_ms) else {
            return;
        };
        #[allow(clippy::cast_sign_loss)]
        let derived = first_audio.saturating_sub(start).max(0) as u64;
        self.derived_ms = Some(derived);
    }
}

/// Tracks latency records keyed by interaction id
#[derive(Debug, Default)]
pub struct LatencyTracker {
    records: HashMap<String, LatencyRecord>,
}

impl LatencyTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record_mut(&mut self, interaction_id: &str) -> &mut LatencyRecord {
        self.records.entry(interaction_id.to_string()).or_default()
    }

    /// Note a VAD end-of-speech signal for an interaction
    pub fn note_speech_complete(&mut self, interaction_id: &str, metadata: &SpeechMetadata) {
        self.note_speech_complete_at(interaction_id, metadata, now_ms());
    }

    /// Note the arrival of the final user transcript for an interaction
    pub fn note_user_text(&mut self, interaction_id: &str, text: &str) {
        self.note_user_text_at(interaction_id, text, now_ms());
    }

    /// Note the first synthesized audio chunk for an interaction;
    /// later chunks for the same interaction leave the record unchanged
    pub fn note_first_audio(&mut self, interaction_id: &str) {
        self.note_first_audio_at(interaction_id, now_ms());
    }

    pub(crate) fn note_speech_complete_at(
        &mut self,
        interaction_id: &str,
        metadata: &SpeechMetadata,
        at_ms: i64,
    ) {
        let record = self.record_mut(interaction_id);
        if record.speech_complete_ms.is_none() {
            record.speech_complete_ms = Some(at_ms);
        }
        if record.upstream_hint_ms.is_none() {
            record.upstream_hint_ms = metadata.latency_hint_ms;
        }
        record.try_derive();
    }

    pub(crate) fn note_user_text_at(&mut self, interaction_id: &str, text: &str, at_ms: i64) {
        let record = self.record_mut(interaction_id);
        if record.user_text_ms.is_none() {
            record.user_text_ms = Some(at_ms);
        }
        record.input_text = Some(text.to_string());
        record.try_derive();
    }

    pub(crate) fn note_first_audio_at(&mut self, interaction_id: &str, at_ms: i64) {
        let record = self.record_mut(interaction_id);
        if record.first_audio_ms.is_none() {
            record.first_audio_ms = Some(at_ms);
        }
        record.try_derive();
    }

    /// Look up the record for an interaction
    #[must_use]
    pub fn record(&self, interaction_id: &str) -> Option<&LatencyRecord> {
        self.records.get(interaction_id)
    }

    /// Derived latency for an interaction, if computed
    #[must_use]
    pub fn derived_ms(&self, interaction_id: &str) -> Option<u64> {
        self.records.get(interaction_id)?.derived_ms
    }

    /// Number of tracked interactions
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no interactions are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
