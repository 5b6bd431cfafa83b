//! Voice API endpoints for speech-to-text and text-to-speech

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::{ApiState, error_response};
use crate::voice::{Transcript, synthesize_all};

/// Build voice router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/transcribe", post(transcribe))
        .route("/synthesize", post(synthesize))
        .route("/capabilities", get(capabilities))
        .with_state(state)
}

/// Voice capabilities response
#[derive(Debug, Serialize)]
pub struct VoiceCapabilities {
    /// Transcription backend in use ("fallback" without a credential)
    pub stt_provider: &'static str,
    pub tts_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_provider: Option<&'static str>,
    pub tts_chunk_chars: usize,
}

/// Get voice capabilities
async fn capabilities(State(state): State<Arc<ApiState>>) -> Json<VoiceCapabilities> {
    Json(VoiceCapabilities {
        stt_provider: state.transcriber.name(),
        tts_available: state.synthesizer.is_some(),
        tts_provider: state.synthesizer.as_ref().map(|s| s.name()),
        tts_chunk_chars: state.tts.chunk_chars,
    })
}

/// Transcribe audio to text
///
/// Accepts audio in WAV format (audio/wav) or `WebM` format (audio/webm)
async fn transcribe(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Transcript>, VoiceError> {
    if body.is_empty() {
        return Err(VoiceError::BadRequest("Empty audio data"));
    }

    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("audio/wav");

    let transcript = state
        .transcriber
        .transcribe(&body, mime)
        .await
        .map_err(|e| VoiceError::TranscriptionFailed(e.to_string()))?;

    Ok(Json(transcript))
}

/// Synthesis request
#[derive(Debug, Deserialize)]
pub struct SynthesizeRequest {
    pub text: String,
}

/// Synthesize text to speech
///
/// Returns audio in MP3 format
async fn synthesize(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SynthesizeRequest>,
) -> Result<Response, VoiceError> {
    let synthesizer = state
        .synthesizer
        .as_ref()
        .ok_or(VoiceError::NotConfigured("TTS not configured (no credential)"))?;

    if request.text.trim().is_empty() {
        return Err(VoiceError::BadRequest("Empty text"));
    }

    let audio = synthesize_all(
        synthesizer.as_ref(),
        &request.text,
        &state.tts.settings,
        state.tts.chunk_chars,
    )
    .await
    .map_err(|e| VoiceError::SynthesisFailed(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "audio/mpeg")],
        audio,
    )
        .into_response())
}

/// Voice API errors
#[derive(Debug)]
pub enum VoiceError {
    NotConfigured(&'static str),
    BadRequest(&'static str),
    TranscriptionFailed(String),
    SynthesisFailed(String),
}

impl IntoResponse for VoiceError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::NotConfigured(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "not_configured",
                msg.to_string(),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.to_string()),
            Self::TranscriptionFailed(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "transcription_failed",
                msg,
            ),
            Self::SynthesisFailed(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "synthesis_failed", msg)
            }
        };

        error_response(status, code, message)
    }
}
