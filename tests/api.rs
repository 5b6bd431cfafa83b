//! API endpoint integration tests

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;
use voicespark::agent::{KeywordResponder, TOPICS};
use voicespark::api::{ApiState, SessionRegistry};
use voicespark::config::TtsConfig;
use voicespark::voice::{FALLBACK_TRANSCRIPTS, FallbackTranscriber, Synthesizer};

mod common;
use common::{GREETING, MockSynthesizer, quick_playback, session_config};

fn test_state(synthesizer: Option<Arc<dyn Synthesizer>>) -> Arc<ApiState> {
    Arc::new(ApiState {
        synthesizer,
        ..base_state(5, SessionRegistry::default())
    })
}

fn base_state(max_user_turns: usize, sessions: SessionRegistry) -> ApiState {
    ApiState {
        persona_name: "Beatriz".to_string(),
        session_config: session_config(max_user_turns),
        generator: Arc::new(KeywordResponder::new()),
        transcriber: Arc::new(FallbackTranscriber::new(Duration::ZERO)),
        synthesizer: None,
        tts: TtsConfig::default(),
        playback: quick_playback(),
        sessions,
    }
}

fn build_test_router() -> axum::Router {
    voicespark::api::router(test_state(None))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn create_session(app: &axum::Router) -> String {
    let response = app
        .clone()
        .oneshot(empty_request("POST", "/api/sessions"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = build_test_router();

    let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_ready_reports_backends() {
    let app = build_test_router();
    create_session(&app).await;

    let response = app.oneshot(empty_request("GET", "/ready")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["persona"], "Beatriz");
    assert_eq!(json["active_sessions"], 1);
    assert_eq!(json["backends"]["generator"], "keyword-responder");
    assert_eq!(json["backends"]["transcriber"], "fallback");
    assert!(json["backends"]["synthesizer"].is_null());
}

#[tokio::test]
async fn test_create_session_seeds_greeting() {
    let app = build_test_router();

    let response = app
        .oneshot(empty_request("POST", "/api/sessions"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert!(json["id"].is_string());
    assert_eq!(json["persona"], "Beatriz");
    assert_eq!(json["phase"], "idle");
    assert_eq!(json["userTurnCount"], 0);
    assert_eq!(json["maxUserTurns"], 5);
    assert_eq!(json["messages"].as_array().unwrap().len(), 1);
    assert_eq!(json["messages"][0]["role"], "assistant");
    assert_eq!(json["messages"][0]["content"], GREETING);
}

#[tokio::test]
async fn test_unknown_session_not_found() {
    let app = build_test_router();

    let response = app
        .oneshot(empty_request(
            "GET",
            "/api/sessions/00000000-0000-0000-0000-000000000000",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "session_not_found");
}

#[tokio::test]
async fn test_submit_message_replies() {
    let app = build_test_router();
    let id = create_session(&app).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/sessions/{id}/messages"),
            &json!({ "text": "How can I help with sundowning?" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["outcome"], "replied");
    assert_eq!(json["reply"]["role"], "assistant");
    assert_eq!(json["reply"]["content"], TOPICS[0].response);

    let response = app
        .oneshot(empty_request("GET", &format!("/api/sessions/{id}")))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["userTurnCount"], 1);
    assert_eq!(json["messages"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_blank_message_rejected() {
    let app = build_test_router();
    let id = create_session(&app).await;

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/api/sessions/{id}/messages"),
            &json!({ "text": "   " }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["outcome"], "rejected");
    assert_eq!(json["reason"], "blank");
}

#[tokio::test]
async fn test_reset_session() {
    let app = build_test_router();
    let id = create_session(&app).await;

    app.clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/sessions/{id}/messages"),
            &json!({ "text": "I'm so tired" }),
        ))
        .await
        .unwrap();

    let response = app
        .oneshot(empty_request("POST", &format!("/api/sessions/{id}/reset")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["id"], id);
    assert_eq!(json["userTurnCount"], 0);
    assert_eq!(json["messages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_session() {
    let app = build_test_router();
    let id = create_session(&app).await;

    let response = app
        .clone()
        .oneshot(empty_request("DELETE", &format!("/api/sessions/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(empty_request("GET", &format!("/api/sessions/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_submit_speech_transcribes_and_replies() {
    let app = build_test_router();
    let id = create_session(&app).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/sessions/{id}/speech"))
                .header(header::CONTENT_TYPE, "audio/wav")
                .body(Body::from(vec![1u8; 128]))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["transcript"]["text"], FALLBACK_TRANSCRIPTS[0].0);
    assert_eq!(json["transcript"]["sentiment"]["label"], "neutral");
    assert_eq!(json["submission"]["outcome"], "replied");
    assert_eq!(json["submission"]["reply"]["content"], TOPICS[0].response);
}

#[tokio::test]
async fn test_submit_empty_speech_rejected() {
    let app = build_test_router();
    let id = create_session(&app).await;

    let response = app
        .oneshot(empty_request("POST", &format!("/api/sessions/{id}/speech")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_transcribe_endpoint() {
    let app = build_test_router();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/voice/transcribe")
                .header(header::CONTENT_TYPE, "audio/webm")
                .body(Body::from(vec![1u8; 64]))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["text"], FALLBACK_TRANSCRIPTS[0].0);
}

#[tokio::test]
async fn test_transcribe_empty_body() {
    let app = build_test_router();

    let response = app
        .oneshot(empty_request("POST", "/api/voice/transcribe"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_synthesize_without_credential() {
    let app = build_test_router();

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/voice/synthesize",
            &json!({ "text": "Hello there." }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "not_configured");
}

#[tokio::test]
async fn test_synthesize_returns_audio() {
    let app = voicespark::api::router(test_state(Some(Arc::new(MockSynthesizer::new()))));

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/voice/synthesize",
            &json!({ "text": "Hello there. How are you?" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"[Hello there. How are you?]");
}

#[tokio::test]
async fn test_synthesize_failure() {
    let app = voicespark::api::router(test_state(Some(Arc::new(MockSynthesizer::failing()))));

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/voice/synthesize",
            &json!({ "text": "Hello there." }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "synthesis_failed");
}

#[tokio::test]
async fn test_voice_capabilities() {
    let app = build_test_router();

    let response = app
        .oneshot(empty_request("GET", "/api/voice/capabilities"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["stt_provider"], "fallback");
    assert_eq!(json["tts_available"], false);
    assert!(json.get("tts_provider").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_ended_session_is_evicted_after_retention() {
    let app = voicespark::api::router(Arc::new(base_state(
        1,
        SessionRegistry::new(Duration::from_secs(2)),
    )));
    let id = create_session(&app).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/sessions/{id}/messages"),
            &json!({ "text": "Thank you for the tips" }),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["outcome"], "replied");

    // Ended after the closing delay, still readable during retention
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let response = app
        .clone()
        .oneshot(empty_request("GET", &format!("/api/sessions/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["phase"], "ended");

    tokio::time::sleep(Duration::from_secs(3)).await;
    let response = app
        .oneshot(empty_request("GET", &format!("/api/sessions/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_session_events_stream() {
    let app = build_test_router();
    let id = create_session(&app).await;

    let response = app
        .oneshot(empty_request("GET", &format!("/api/sessions/{id}/events")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
}
