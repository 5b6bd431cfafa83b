//! TOML configuration file loading
//!
//! Supports `~/.config/voicespark/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{CaptureMode, MissingCredential, SttProvider, TtsProvider};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceSparkConfigFile {
    /// Embedded persona id (e.g. "beatriz")
    pub persona: Option<String>,

    /// Path to a persona JSON/TOML file, overrides `persona`
    pub persona_file: Option<PathBuf>,

    /// Demo conversation configuration
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Language model configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Voice/audio configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerFileConfig,
}

/// Demo conversation configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Number of accepted user messages before the demo ends
    pub max_user_turns: Option<usize>,

    /// Delay between the final reply and the ended state
    pub closing_delay_ms: Option<u64>,

    /// Override the persona greeting
    pub greeting: Option<String>,

    /// Override the persona directive
    pub persona_directive: Option<String>,

    /// Override the closing directive
    pub closing_directive: Option<String>,

    /// Submit the final transcript as soon as capture stops
    pub auto_submit_transcript: Option<bool>,
}

/// Language model configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// Model identifier (e.g. "gpt-4o-mini")
    pub model: Option<String>,

    /// Chat-completions base URL
    pub base_url: Option<String>,

    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
}

/// Voice processing configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// Enable local microphone and speaker
    pub enabled: Option<bool>,

    #[serde(default)]
    pub stt: SttFileConfig,

    #[serde(default)]
    pub tts: TtsFileConfig,

    #[serde(default)]
    pub playback: PlaybackFileConfig,
}

/// Speech-to-text configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    pub provider: Option<SttProvider>,
    pub mode: Option<CaptureMode>,
    pub model: Option<String>,
    pub language: Option<String>,
    pub base_url: Option<String>,
    pub max_recording_ms: Option<u64>,
}

/// Text-to-speech configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub provider: Option<TtsProvider>,
    pub voice_id: Option<String>,
    pub model: Option<String>,
    pub stability: Option<f32>,
    pub similarity_boost: Option<f32>,
    pub style: Option<f32>,
    pub use_speaker_boost: Option<bool>,
    pub output_format: Option<String>,
    pub speaking_rate: Option<f32>,
    pub streaming: Option<bool>,
    pub chunk_chars: Option<usize>,
    pub missing_credential: Option<MissingCredential>,
    pub base_url: Option<String>,
}

/// Simulated playback bounds
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    pub ms_per_char: Option<u64>,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,
}

/// Load the TOML config file from `path`, or the standard path when `None`
///
/// Returns `VoiceSparkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> VoiceSparkConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return VoiceSparkConfigFile::default();
    };

    if !path.exists() {
        return VoiceSparkConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoiceSparkConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoiceSparkConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/voicespark/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voicespark").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let fc: VoiceSparkConfigFile = toml::from_str(
            r#"
persona = "synthia"

[session]
max_user_turns = 3
auto_submit_transcript = false

[voice.stt]
provider = "whisper"
mode = "batch"

[voice.tts]
missing_credential = "fail"
stability = 0.4
"#,
        )
        .unwrap();

        assert_eq!(fc.persona.as_deref(), Some("synthia"));
        assert_eq!(fc.session.max_user_turns, Some(3));
        assert_eq!(fc.session.auto_submit_transcript, Some(false));
        assert_eq!(fc.voice.stt.provider, Some(SttProvider::Whisper));
        assert_eq!(fc.voice.stt.mode, Some(CaptureMode::Batch));
        assert_eq!(fc.voice.tts.missing_credential, Some(MissingCredential::Fail));
        assert!(fc.llm.model.is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let fc = load_config_file(Some(&dir.path().join("absent.toml")));
        assert!(fc.persona.is_none());
        assert!(fc.server.port.is_none());
    }

    #[test]
    fn unparsable_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "session = [not toml").unwrap();
        let fc = load_config_file(Some(&path));
        assert!(fc.session.max_user_turns.is_none());
    }
}
