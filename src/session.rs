//! Server-side session registry
//!
//! Maps a caller-generated session identifier to its conversational state,
//! credentials, and derived per-voice pipeline handles. Entries are mutated
//! only by the server task handling that session's requests; no session sees
//! another session's state. Pipeline handles are a shared cache keyed by
//! voice identifier — creation is lazy with no suspension point between the
//! existence check and insertion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, oneshot};

use crate::pipeline::SpeechPipeline;
use crate::{Error, Result};

/// One message retained in a session's conversational state
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    /// Interaction the message belongs to
    pub interaction_id: String,
    /// Whether the agent produced the text
    pub from_agent: bool,
    /// Final display text
    pub text: String,
    /// Arrival time
    pub timestamp: DateTime<Utc>,
}

/// Request body for session creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSession {
    /// Caller-generated opaque identifier, unique per conversation
    pub session_id: String,
    /// Requested voice identifier; server default when absent
    #[serde(default)]
    pub voice_id: Option<String>,
    /// Requested avatar identifier; server default when absent
    #[serde(default)]
    pub avatar_id: Option<String>,
    /// Per-session credential; server default when absent
    #[serde(default)]
    pub credential: Option<String>,
}

/// Agent descriptor returned on session creation and lookup
#[derive(Debug, Clone, Serialize)]
pub struct AgentDescriptor {
    pub session_id: String,
    pub voice_id: String,
    pub avatar_id: String,
    /// Number of retained messages
    pub message_count: usize,
}

/// Server-side state for one conversational session
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub voice_id: String,
    pub avatar_id: String,
    pub credential: Option<String>,
    pub messages: Vec<StoredMessage>,
    pub current_interaction: Option<String>,
    pub unloaded: bool,
    pub transport_bound: bool,
    /// Fires when the session is unloaded out from under a live transport
    pub transport_close: Option<oneshot::Sender<()>>,
}

impl Session {
    fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor {
            session_id: self.id.clone(),
            voice_id: self.voice_id.clone(),
            avatar_id: self.avatar_id.clone(),
            message_count: self.messages.len(),
        }
    }
}

/// Synchronous constructor for per-voice pipeline handles
pub type PipelineFactory = Arc<dyn Fn(&str) -> Arc<dyn SpeechPipeline> + Send + Sync>;

/// Registry of live sessions and shared per-voice pipeline handles
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    // Synchronous lock: get-or-create must not suspend between the existence
    // check and the insertion
    pipelines: SyncMutex<HashMap<String, Arc<dyn SpeechPipeline>>>,
    factory: PipelineFactory,
    default_voice: String,
    default_avatar: String,
    require_credential: bool,
    default_credential: Option<String>,
}

impl SessionRegistry {
    /// Create a registry with a pipeline factory and server defaults
    #[must_use]
    pub fn new(
        factory: PipelineFactory,
        default_voice: &str,
        default_avatar: &str,
        require_credential: bool,
        default_credential: Option<String>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            pipelines: SyncMutex::new(HashMap::new()),
            factory,
            default_voice: default_voice.to_string(),
            default_avatar: default_avatar.to_string(),
            require_credential,
            default_credential,
        }
    }

    /// Create a session and return its agent descriptor
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when a required credential is absent (checked
    /// before any state is created — a rejected session is never partially
    /// created) and `Error::SessionExists` for a duplicate identifier
    pub async fn create(&self, request: CreateSession) -> Result<AgentDescriptor> {
        let credential = request
            .credential
            .or_else(|| self.default_credential.clone());
        if self.require_credential && credential.is_none() {
            return Err(Error::Config(
                "session credential required and no server default configured".to_string(),
            ));
        }

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&request.session_id) {
            return Err(Error::SessionExists(request.session_id));
        }

        let session = Session {
            id: request.session_id.clone(),
            voice_id: request
                .voice_id
                .unwrap_or_else(|| self.default_voice.clone()),
            avatar_id: request
                .avatar_id
                .unwrap_or_else(|| self.default_avatar.clone()),
            credential,
            messages: Vec::new(),
            current_interaction: None,
            unloaded: false,
            transport_bound: false,
            transport_close: None,
        };
        let descriptor = session.descriptor();
        sessions.insert(request.session_id, session);

        tracing::info!(session_id = %descriptor.session_id, voice_id = %descriptor.voice_id, "session created");
        Ok(descriptor)
    }

    /// Look up a session's descriptor
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` for an unknown or unloaded session
    pub async fn descriptor(&self, session_id: &str) -> Result<AgentDescriptor> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .filter(|s| !s.unloaded)
            .map(Session::descriptor)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Bind the single live transport to a session, returning the session's
    /// pipeline handle and a signal that fires if the session is unloaded
    /// while the transport is still live
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` for an unknown/unloaded session and
    /// `Error::Transport` when a transport is already bound
    pub async fn bind_transport(
        &self,
        session_id: &str,
    ) -> Result<(Arc<dyn SpeechPipeline>, oneshot::Receiver<()>)> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .filter(|s| !s.unloaded)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if session.transport_bound {
            return Err(Error::Transport(format!(
                "session {session_id} already has a live transport"
            )));
        }
        let (close_tx, close_rx) = oneshot::channel();
        session.transport_bound = true;
        session.transport_close = Some(close_tx);
        let voice_id = session.voice_id.clone();
        drop(sessions);

        Ok((self.pipeline_for(&voice_id), close_rx))
    }

    /// Release a session's transport binding
    pub async fn release_transport(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.transport_bound = false;
            session.transport_close = None;
        }
    }

    /// Record a finalized message into the session's conversational state
    ///
    /// Recording into an unloaded session is a no-op.
    pub async fn record_message(&self, session_id: &str, message: StoredMessage) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(session_id).filter(|s| !s.unloaded) {
            session.current_interaction = Some(message.interaction_id.clone());
            session.messages.push(message);
        }
    }

    /// Tear down a session, releasing the resources it still references
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` for an unknown session. Unloading an
    /// already unloaded session is a no-op.
    pub async fn unload(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        session.unloaded = true;
        session.transport_bound = false;
        if let Some(close) = session.transport_close.take() {
            let _ = close.send(());
        }
        tracing::info!(session_id, "session unloaded");
        Ok(())
    }

    /// Get or lazily create the shared pipeline handle for a voice
    ///
    /// Check-then-create is atomic from the scheduler's perspective: the
    /// factory runs synchronously under the cache lock.
    #[must_use]
    pub fn pipeline_for(&self, voice_id: &str) -> Arc<dyn SpeechPipeline> {
        let mut pipelines = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            pipelines
                .entry(voice_id.to_string())
                .or_insert_with(|| (self.factory)(voice_id)),
        )
    }

    /// Number of live (non-unloaded) sessions
    #[must_use]
    pub async fn live_count(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| !s.unloaded)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use super::*;
    use crate::pipeline::{PipelineEvent, PipelineStream};

    struct NullStream;

    #[async_trait::async_trait]
    impl PipelineStream for NullStream {
        async fn push_audio(&mut self, _samples: Vec<f32>) -> Result<()> {
            Ok(())
        }
        async fn push_text(&mut self, _interaction_id: &str, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn end_audio(&mut self) -> Result<()> {
            Ok(())
        }
        async fn cancel(&mut self, _interaction_id: &str) -> Result<()> {
            Ok(())
        }
        fn events(&mut self) -> Option<mpsc::Receiver<PipelineEvent>> {
            None
        }
    }

    struct NullPipeline;

    impl SpeechPipeline for NullPipeline {
        fn open(&self, _session_id: &str) -> Box<dyn PipelineStream> {
            Box::new(NullStream)
        }
    }

    fn counting_registry(require_credential: bool) -> (Arc<SessionRegistry>, Arc<AtomicUsize>) {
        let constructions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&constructions);
        let factory: PipelineFactory = Arc::new(move |_voice| {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(NullPipeline)
        });
        let registry = Arc::new(SessionRegistry::new(
            factory,
            "voice-a",
            "avatar-a",
            require_credential,
            None,
        ));
        (registry, constructions)
    }

    fn request(id: &str) -> CreateSession {
        CreateSession {
            session_id: id.to_string(),
            voice_id: None,
            avatar_id: None,
            credential: None,
        }
    }

    #[tokio::test]
    async fn create_applies_server_defaults() {
        let (registry, _) = counting_registry(false);
        let descriptor = registry.create(request("s1")).await.unwrap();
        assert_eq!(descriptor.voice_id, "voice-a");
        assert_eq!(descriptor.avatar_id, "avatar-a");
        assert_eq!(descriptor.message_count, 0);
    }

    #[tokio::test]
    async fn duplicate_session_id_is_rejected() {
        let (registry, _) = counting_registry(false);
        registry.create(request("s1")).await.unwrap();
        assert!(matches!(
            registry.create(request("s1")).await,
            Err(Error::SessionExists(_))
        ));
    }

    #[tokio::test]
    async fn missing_required_credential_rejects_before_creation() {
        let (registry, _) = counting_registry(true);
        assert!(matches!(
            registry.create(request("s1")).await,
            Err(Error::Config(_))
        ));
        // Nothing was partially created
        assert!(matches!(
            registry.descriptor("s1").await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn pipeline_handles_are_shared_per_voice() {
        let (registry, constructions) = counting_registry(false);
        let first = registry.pipeline_for("voice-a");
        let second = registry.pipeline_for("voice-a");
        let other = registry.pipeline_for("voice-b");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(constructions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn only_one_transport_binds_at_a_time() {
        let (registry, _) = counting_registry(false);
        registry.create(request("s1")).await.unwrap();

        registry.bind_transport("s1").await.unwrap();
        assert!(matches!(
            registry.bind_transport("s1").await,
            Err(Error::Transport(_))
        ));

        registry.release_transport("s1").await;
        assert!(registry.bind_transport("s1").await.is_ok());
    }

    #[tokio::test]
    async fn binding_an_unknown_session_is_distinguishable() {
        let (registry, _) = counting_registry(false);
        assert!(matches!(
            registry.bind_transport("ghost").await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unload_releases_the_session() {
        let (registry, _) = counting_registry(false);
        registry.create(request("s1")).await.unwrap();
        registry.unload("s1").await.unwrap();

        assert!(matches!(
            registry.descriptor("s1").await,
            Err(Error::SessionNotFound(_))
        ));
        assert_eq!(registry.live_count().await, 0);

        // Idempotent
        registry.unload("s1").await.unwrap();
    }

    #[tokio::test]
    async fn unload_signals_the_bound_transport() {
        let (registry, _) = counting_registry(false);
        registry.create(request("s1")).await.unwrap();
        let (_pipeline, closed) = registry.bind_transport("s1").await.unwrap();

        registry.unload("s1").await.unwrap();
        assert!(closed.await.is_ok());
    }

    #[tokio::test]
    async fn record_message_is_a_noop_after_unload() {
        let (registry, _) = counting_registry(false);
        registry.create(request("s1")).await.unwrap();

        let message = |text: &str| StoredMessage {
            interaction_id: "i1".to_string(),
            from_agent: true,
            text: text.to_string(),
            timestamp: Utc::now(),
        };
        registry.record_message("s1", message("kept")).await;
        registry.unload("s1").await.unwrap();
        registry.record_message("s1", message("dropped")).await;

        let sessions = registry.sessions.lock().await;
        assert_eq!(sessions.get("s1").unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn messages_accumulate_in_order() {
        let (registry, _) = counting_registry(false);
        registry.create(request("s1")).await.unwrap();

        for (i, text) in ["hello", "world"].iter().enumerate() {
            registry
                .record_message(
                    "s1",
                    StoredMessage {
                        interaction_id: format!("i{i}"),
                        from_agent: false,
                        text: (*text).to_string(),
                        timestamp: Utc::now(),
                    },
                )
                .await;
        }

        let descriptor = registry.descriptor("s1").await.unwrap();
        assert_eq!(descriptor.message_count, 2);
    }
}
