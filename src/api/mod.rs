//! HTTP API server for VoiceSpark
//!
//! Each API session is an independent [`Conversation`] whose playback is
//! simulated server-side; clients fetch the audio itself from
//! `/api/voice/synthesize`.

pub mod health;
pub mod sessions;
pub mod voice;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, broadcast};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::agent::TurnGenerator;
use crate::config::{SessionConfig, SimulatedPlaybackConfig, TtsConfig};
use crate::session::{Conversation, SessionEvent};
use crate::voice::{Speaker, Synthesizer, Transcriber};
use crate::{Config, Result};

/// How long an ended session stays readable before it is dropped
pub const DEFAULT_ENDED_RETENTION: Duration = Duration::from_secs(300);

type SessionMap = RwLock<HashMap<Uuid, Arc<Conversation>>>;

/// Live conversations keyed by session id
///
/// A session that reaches `Ended` is evicted once the retention period has
/// passed without a reset.
pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    ended_retention: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_ENDED_RETENTION)
    }
}

impl SessionRegistry {
    #[must_use]
    pub fn new(ended_retention: Duration) -> Self {
        Self {
            sessions: Arc::default(),
            ended_retention,
        }
    }

    pub async fn insert(&self, id: Uuid, conversation: Arc<Conversation>) {
        let events = conversation.subscribe();
        self.sessions.write().await.insert(id, conversation);
        tokio::spawn(evict_when_ended(
            Arc::downgrade(&self.sessions),
            id,
            events,
            self.ended_retention,
        ));
    }

    pub async fn get(&self, id: &Uuid) -> Option<Arc<Conversation>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &Uuid) -> Option<Arc<Conversation>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

async fn evict_when_ended(
    sessions: Weak<SessionMap>,
    id: Uuid,
    mut events: broadcast::Receiver<SessionEvent>,
    retention: Duration,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Ended) => {}
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        }

        match tokio::time::timeout(retention, wait_for_reset(&mut events)).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(_) => break,
        }
    }

    let Some(sessions) = sessions.upgrade() else {
        return;
    };
    let removed = sessions.write().await.remove(&id);
    if let Some(conversation) = removed {
        conversation.shutdown().await;
        tracing::info!(session_id = %id, "ended session evicted");
    }
}

/// `true` on a reset, `false` once the conversation is gone
async fn wait_for_reset(events: &mut broadcast::Receiver<SessionEvent>) -> bool {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Reset) => return true,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return false,
        }
    }
}

/// Shared state for API handlers
pub struct ApiState {
    pub persona_name: String,
    pub session_config: SessionConfig,
    pub generator: Arc<dyn TurnGenerator>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
    pub tts: TtsConfig,
    pub playback: SimulatedPlaybackConfig,
    pub sessions: SessionRegistry,
}

impl ApiState {
    /// Build API state from the resolved configuration
    ///
    /// # Errors
    ///
    /// Returns error if a configured backend cannot be constructed
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            persona_name: config.persona.name().to_string(),
            session_config: config.session.clone(),
            generator: crate::agent::from_config(config),
            transcriber: crate::voice::transcriber_from_config(config)?,
            synthesizer: crate::voice::synthesizer_from_config(config)?,
            tts: config.voice.tts.clone(),
            playback: config.voice.playback,
            sessions: SessionRegistry::default(),
        })
    }

    /// Create and register a new conversation
    pub async fn create_session(&self) -> (Uuid, Arc<Conversation>) {
        let speaker = Speaker::new(self.synthesizer.clone(), None, &self.tts, self.playback);
        let conversation = Arc::new(
            Conversation::builder(self.session_config.clone(), Arc::clone(&self.generator))
                .speaker(Arc::new(speaker))
                .build(),
        );

        let id = Uuid::new_v4();
        self.sessions.insert(id, Arc::clone(&conversation)).await;
        tracing::info!(session_id = %id, "session created");
        (id, conversation)
    }
}

/// JSON error body `{ "error": { "code", "message" } }`
pub(crate) fn error_response(status: StatusCode, code: &'static str, message: String) -> Response {
    #[derive(Serialize)]
    struct ErrorResponse {
        error: ErrorBody,
    }

    #[derive(Serialize)]
    struct ErrorBody {
        code: &'static str,
        message: String,
    }

    (
        status,
        Json(ErrorResponse {
            error: ErrorBody { code, message },
        }),
    )
        .into_response()
}

/// HTTP API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub const fn new(state: Arc<ApiState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Build the router with all routes
    pub fn router(&self) -> Router {
        router(Arc::clone(&self.state))
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        tracing::info!("API server stopped");
        Ok(())
    }
}

/// Build the full router over `state`
pub fn router(state: Arc<ApiState>) -> Router {
    // CORS layer for cross-origin requests from frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(sessions::router(Arc::clone(&state)))
        .nest("/api/voice", voice::router(Arc::clone(&state)))
        .merge(health::router())
        .merge(health::ready_router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
