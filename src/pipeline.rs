//! Boundary to the hosted recognition/generation/synthesis graph
//!
//! The gateway never computes speech or language itself; it forwards audio
//! and text to a hosted pipeline and relays the pipeline's ordered event
//! stream down to the client. One [`SpeechPipeline`] handle exists per voice
//! identifier and may be shared by multiple sessions; each session opens its
//! own [`PipelineStream`] conversation on it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::protocol::SpeechMetadata;
use crate::{Error, Result, audio::format};

/// Ordered events emitted by a pipeline conversation
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A new interaction began (speech detected or text submitted)
    NewInteraction { interaction_id: String },
    /// Partial-or-final transcript or response text
    Text {
        interaction_id: String,
        utterance_id: String,
        from_agent: bool,
        text: String,
        is_final: bool,
    },
    /// VAD decided the user stopped speaking
    SpeechComplete {
        interaction_id: String,
        metadata: SpeechMetadata,
    },
    /// A synthesized audio chunk (f32 PCM)
    Audio {
        interaction_id: String,
        seq: u32,
        samples: Vec<f32>,
    },
    /// The current agent response was aborted upstream
    Cancelled { interaction_id: String },
    /// The interaction is complete
    InteractionEnd { interaction_id: String },
    /// Pipeline-side failure
    Error { message: String },
}

/// A per-voice handle to the hosted computation graph
pub trait SpeechPipeline: Send + Sync {
    /// Open a conversation stream for one session
    fn open(&self, session_id: &str) -> Box<dyn PipelineStream>;
}

/// One session's conversation with the hosted pipeline
#[async_trait]
pub trait PipelineStream: Send {
    /// Forward one captured audio batch (f32 PCM) for recognition
    async fn push_audio(&mut self, samples: Vec<f32>) -> Result<()>;

    /// Forward typed user text for generation under an interaction id
    async fn push_text(&mut self, interaction_id: &str, text: &str) -> Result<()>;

    /// Signal the end of the audio capture session
    async fn end_audio(&mut self) -> Result<()>;

    /// Abort an in-flight response for an interaction
    async fn cancel(&mut self, interaction_id: &str) -> Result<()>;

    /// Take the ordered event stream; yields `None` after the first call
    fn events(&mut self) -> Option<mpsc::Receiver<PipelineEvent>>;
}

#[derive(Debug, Serialize)]
struct RecognizeRequest<'a> {
    voice_id: &'a str,
    session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct RecognizeReply {
    #[serde(default)]
    interaction_id: Option<String>,
    #[serde(default)]
    transcript: Option<TranscriptReply>,
    #[serde(default)]
    speech_complete: bool,
    #[serde(default)]
    latency_hint_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TranscriptReply {
    utterance_id: String,
    text: String,
    is_final: bool,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    voice_id: &'a str,
    session_id: &'a str,
    interaction_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateReply {
    utterance_id: String,
    text: String,
    /// Base64 f32-LE PCM chunks in playback order
    #[serde(default)]
    audio: Vec<String>,
}

/// Pipeline handle backed by a hosted HTTP service
pub struct RemotePipeline {
    client: reqwest::Client,
    base_url: String,
    voice_id: String,
    sample_rate: u32,
}

impl RemotePipeline {
    /// Create a handle for `voice_id` against the service at `base_url`
    ///
    /// `sample_rate` is the shared capture rate; forwarded audio is wrapped
    /// as WAV labelled with it.
    #[must_use]
    pub fn new(base_url: &str, voice_id: &str, sample_rate: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            voice_id: voice_id.to_string(),
            sample_rate,
        }
    }
}

impl SpeechPipeline for RemotePipeline {
    fn open(&self, session_id: &str) -> Box<dyn PipelineStream> {
        let (tx, rx) = mpsc::channel(64);
        Box::new(RemoteStream {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            voice_id: self.voice_id.clone(),
            sample_rate: self.sample_rate,
            session_id: session_id.to_string(),
            current_interaction: None,
            events_tx: tx,
            events_rx: Some(rx),
        })
    }
}

/// One session's conversation against the remote pipeline service
struct RemoteStream {
    client: reqwest::Client,
    base_url: String,
    voice_id: String,
    sample_rate: u32,
    session_id: String,
    current_interaction: Option<String>,
    events_tx: mpsc::Sender<PipelineEvent>,
    events_rx: Option<mpsc::Receiver<PipelineEvent>>,
}

impl RemoteStream {
    async fn emit(&self, event: PipelineEvent) {
        if self.events_tx.send(event).await.is_err() {
            tracing::debug!(session_id = %self.session_id, "pipeline event consumer gone");
        }
    }

    async fn emit_recognition(&mut self, reply: RecognizeReply) {
        if let Some(interaction_id) = reply.interaction_id {
            if self.current_interaction.as_deref() != Some(&interaction_id) {
                self.current_interaction = Some(interaction_id.clone());
                self.emit(PipelineEvent::NewInteraction {
                    interaction_id: interaction_id.clone(),
                })
                .await;
            }
            if let Some(transcript) = reply.transcript {
                self.emit(PipelineEvent::Text {
                    interaction_id: interaction_id.clone(),
                    utterance_id: transcript.utterance_id,
                    from_agent: false,
                    text: transcript.text,
                    is_final: transcript.is_final,
                })
                .await;
            }
            if reply.speech_complete {
                self.emit(PipelineEvent::SpeechComplete {
                    interaction_id,
                    metadata: SpeechMetadata {
                        latency_hint_ms: reply.latency_hint_ms,
                        vad_score: None,
                    },
                })
                .await;
            }
        }
    }
}

#[async_trait]
impl PipelineStream for RemoteStream {
    async fn push_audio(&mut self, samples: Vec<f32>) -> Result<()> {
        let wav = format::pcm16_to_wav(&format::f32_to_i16(&samples), self.sample_rate)?;
        let query = serde_json::to_string(&RecognizeRequest {
            voice_id: &self.voice_id,
            session_id: &self.session_id,
        })?;

        let response = self
            .client
            .post(format!("{}/v1/recognize", self.base_url))
            .header("Content-Type", "audio/wav")
            .header("X-Pipeline-Context", query)
            .body(wav)
            .send()
            .await
            .map_err(|e| Error::Pipeline(format!("recognize request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Pipeline(format!("recognize failed: {status}")));
        }

        let reply: RecognizeReply = response
            .json()
            .await
            .map_err(|e| Error::Pipeline(format!("malformed recognize reply: {e}")))?;
        self.emit_recognition(reply).await;
        Ok(())
    }

    async fn push_text(&mut self, interaction_id: &str, text: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v1/generate", self.base_url))
            .json(&GenerateRequest {
                voice_id: &self.voice_id,
                session_id: &self.session_id,
                interaction_id,
                text,
            })
            .send()
            .await
            .map_err(|e| Error::Pipeline(format!("generate request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Pipeline(format!("generate failed: {status}")));
        }

        let reply: GenerateReply = response
            .json()
            .await
            .map_err(|e| Error::Pipeline(format!("malformed generate reply: {e}")))?;

        self.emit(PipelineEvent::Text {
            interaction_id: interaction_id.to_string(),
            utterance_id: reply.utterance_id,
            from_agent: true,
            text: reply.text,
            is_final: true,
        })
        .await;

        for (seq, chunk) in reply.audio.iter().enumerate() {
            match format::decode_payload(chunk) {
                Ok(samples) => {
                    #[allow(clippy::cast_possible_truncation)]
                    self.emit(PipelineEvent::Audio {
                        interaction_id: interaction_id.to_string(),
                        seq: seq as u32,
                        samples,
                    })
                    .await;
                }
                Err(e) => {
                    // Drop the malformed chunk, keep the rest of the response
                    tracing::warn!(error = %e, seq, "dropping malformed synthesis chunk");
                }
            }
        }

        self.emit(PipelineEvent::InteractionEnd {
            interaction_id: interaction_id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn cancel(&mut self, interaction_id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v1/generate/cancel", self.base_url))
            .json(&GenerateRequest {
                voice_id: &self.voice_id,
                session_id: &self.session_id,
                interaction_id,
                text: "",
            })
            .send()
            .await
            .map_err(|e| Error::Pipeline(format!("cancel request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Pipeline(format!(
                "cancel failed: {}",
                response.status()
            )));
        }

        self.emit(PipelineEvent::Cancelled {
            interaction_id: interaction_id.to_string(),
        })
        .await;
        Ok(())
    }

    async fn end_audio(&mut self) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v1/recognize/end", self.base_url))
            .json(&RecognizeRequest {
                voice_id: &self.voice_id,
                session_id: &self.session_id,
            })
            .send()
            .await
            .map_err(|e| Error::Pipeline(format!("recognize end failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Pipeline(format!(
                "recognize end failed: {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn events(&mut self) -> Option<mpsc::Receiver<PipelineEvent>> {
        self.events_rx.take()
    }
}
