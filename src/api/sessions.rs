//! Conversation session endpoints

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use super::{ApiState, error_response};
use crate::message::Message;
use crate::session::{Conversation, RejectReason, SessionEvent, Snapshot, TurnOutcome};
use crate::voice::Transcript;

/// Build session router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route(
            "/api/sessions/{id}",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/{id}/messages", post(submit_message))
        .route("/api/sessions/{id}/speech", post(submit_speech))
        .route("/api/sessions/{id}/reset", post(reset_session))
        .route("/api/sessions/{id}/events", get(session_events))
        .with_state(state)
}

/// Session response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub id: Uuid,
    /// Assistant display name
    pub persona: String,
    #[serde(flatten)]
    pub snapshot: Snapshot,
}

/// Message submission request
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub text: String,
}

/// Outcome of a submission
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitResponse {
    Replied { reply: Message },
    Rejected { reason: RejectReason },
    Discarded,
}

impl From<TurnOutcome> for SubmitResponse {
    fn from(outcome: TurnOutcome) -> Self {
        match outcome {
            TurnOutcome::Replied(reply) => Self::Replied { reply },
            TurnOutcome::Rejected(reason) => Self::Rejected { reason },
            TurnOutcome::Discarded => Self::Discarded,
        }
    }
}

/// Speech submission response
#[derive(Debug, Serialize)]
pub struct SpeechResponse {
    pub transcript: Transcript,
    /// Absent when nothing was recognized
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission: Option<SubmitResponse>,
}

/// Create a new conversation
async fn create_session(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<SessionResponse>) {
    let (id, conversation) = state.create_session().await;
    (
        StatusCode::CREATED,
        Json(SessionResponse {
            id,
            persona: state.persona_name.clone(),
            snapshot: conversation.snapshot(),
        }),
    )
}

/// Get the current state of a conversation
async fn get_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, SessionError> {
    let conversation = lookup(&state, id).await?;
    Ok(Json(SessionResponse {
        id,
        persona: state.persona_name.clone(),
        snapshot: conversation.snapshot(),
    }))
}

/// End and remove a conversation
async fn delete_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, SessionError> {
    let conversation = state
        .sessions
        .remove(&id)
        .await
        .ok_or(SessionError::NotFound(id))?;
    conversation.shutdown().await;
    tracing::info!(session_id = %id, "session deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Submit a typed user message
async fn submit_message(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, SessionError> {
    let conversation = lookup(&state, id).await?;
    let outcome = conversation
        .submit_user_turn(&request.text)
        .await
        .map_err(|e| SessionError::GenerationFailed(e.to_string()))?;
    Ok(Json(outcome.into()))
}

/// Submit recorded speech: transcribed in one batch, then submitted
///
/// Accepts WAV (audio/wav) or `WebM` (audio/webm) bodies
async fn submit_speech(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SpeechResponse>, SessionError> {
    let conversation = lookup(&state, id).await?;
    if body.is_empty() {
        return Err(SessionError::BadRequest("Empty audio data"));
    }

    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("audio/wav");
    let transcript = state
        .transcriber
        .transcribe(&body, mime)
        .await
        .map_err(|e| SessionError::TranscriptionFailed(e.to_string()))?;

    if transcript.text.trim().is_empty() {
        return Ok(Json(SpeechResponse {
            transcript,
            submission: None,
        }));
    }

    conversation.set_pending_input(&transcript.text);
    let outcome = conversation
        .submit_pending_input()
        .await
        .map_err(|e| SessionError::GenerationFailed(e.to_string()))?;

    Ok(Json(SpeechResponse {
        transcript,
        submission: Some(outcome.into()),
    }))
}

/// Restart a conversation from the greeting
async fn reset_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, SessionError> {
    let conversation = lookup(&state, id).await?;
    conversation.reset().await;
    Ok(Json(SessionResponse {
        id,
        persona: state.persona_name.clone(),
        snapshot: conversation.snapshot(),
    }))
}

/// Stream session events as server-sent events
async fn session_events(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, SessionError> {
    let conversation = lookup(&state, id).await?;
    let stream = BroadcastStream::new(conversation.subscribe()).filter_map(|event| async move {
        let event = event.ok()?;
        Event::default()
            .event(event_name(&event))
            .json_data(&event)
            .ok()
            .map(Ok)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// SSE event name for a session event
const fn event_name(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::MessageAppended(_) => "message",
        SessionEvent::PhaseChanged(_) => "phase",
        SessionEvent::SpeakingChanged(_) => "speaking",
        SessionEvent::ListeningChanged(_) => "listening",
        SessionEvent::TranscriptPreview(_) => "preview",
        SessionEvent::PendingInputChanged(_) => "pending_input",
        SessionEvent::Notice(_) => "notice",
        SessionEvent::Ended => "ended",
        SessionEvent::Reset => "reset",
    }
}

async fn lookup(state: &ApiState, id: Uuid) -> Result<Arc<Conversation>, SessionError> {
    state.sessions.get(&id).await.ok_or(SessionError::NotFound(id))
}

/// Session API errors
#[derive(Debug)]
pub enum SessionError {
    NotFound(Uuid),
    BadRequest(&'static str),
    TranscriptionFailed(String),
    GenerationFailed(String),
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::NotFound(id) => (
                StatusCode::NOT_FOUND,
                "session_not_found",
                format!("no session with id {id}"),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.to_string()),
            Self::TranscriptionFailed(msg) => {
                (StatusCode::BAD_GATEWAY, "transcription_failed", msg)
            }
            Self::GenerationFailed(msg) => (StatusCode::BAD_GATEWAY, "generation_failed", msg),
        };

        error_response(status, code, message)
    }
}
