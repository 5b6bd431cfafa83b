//! Error types for VoiceSpark

use thiserror::Error;

/// Result type alias for VoiceSpark operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the conversation core and its adapters
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Microphone access was refused by the host
    #[error("microphone permission denied: {0}")]
    MicrophonePermission(String),

    /// No capture engine or input device is available
    #[error("speech capture unsupported: {0}")]
    CaptureUnsupported(String),

    /// Capture engine failed while recording
    #[error("capture error: {0}")]
    Capture(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model error
    #[error("language model error: {0}")]
    Llm(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Audio playback error
    #[error("playback error: {0}")]
    Playback(String),

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
