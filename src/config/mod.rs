//! Configuration management for VoiceSpark
//!
//! Values resolve in the order env > TOML file > persona > default.

pub mod file;

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::persona::{DEFAULT_PERSONA_ID, Persona};
use crate::Result;

/// Default number of accepted user messages in a demo conversation
pub const DEFAULT_MAX_USER_TURNS: usize = 5;

/// Default delay between the final reply and the ended state
pub const DEFAULT_CLOSING_DELAY: Duration = Duration::from_millis(1000);

/// Default maximum batch recording length
pub const DEFAULT_MAX_RECORDING: Duration = Duration::from_millis(5000);

/// Default per-request synthesis character budget
pub const DEFAULT_TTS_CHUNK_CHARS: usize = 200;

/// VoiceSpark configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Active persona
    pub persona: Persona,

    /// Demo conversation configuration
    pub session: SessionConfig,

    /// Language model configuration
    pub llm: LlmConfig,

    /// Voice configuration
    pub voice: VoiceConfig,

    /// API keys
    pub api_keys: ApiKeys,

    /// HTTP API server configuration
    pub api_server: ApiServerConfig,
}

/// Demo conversation configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Accepted user messages before the conversation ends
    pub max_user_turns: usize,

    /// Delay between the final reply and the ended state
    pub closing_delay: Duration,

    /// Seeded assistant greeting
    pub greeting: String,

    /// Directive for regular turns
    pub persona_directive: String,

    /// Directive for the final turn
    pub closing_directive: String,

    /// Submit the definitive transcript as soon as capture stops.
    /// When false the transcript only becomes pending input.
    pub auto_submit_transcript: bool,
}

impl SessionConfig {
    /// Session configuration taking texts from a persona
    #[must_use]
    pub fn from_persona(persona: &Persona) -> Self {
        Self {
            max_user_turns: DEFAULT_MAX_USER_TURNS,
            closing_delay: DEFAULT_CLOSING_DELAY,
            greeting: persona.greeting().to_string(),
            persona_directive: persona.directive().to_string(),
            closing_directive: persona.closing_directive().to_string(),
            auto_submit_transcript: true,
        }
    }
}

/// Chat-completions configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            temperature: 0.7,
            max_tokens: 500,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
        }
    }
}

/// Voice processing configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Use the local microphone and speaker
    pub enabled: bool,

    pub stt: SttConfig,

    pub tts: TtsConfig,

    pub playback: SimulatedPlaybackConfig,
}

/// STT provider backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    Deepgram,
    Whisper,
}

/// How captured speech is turned into text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Live interim and final fragments while recording
    Streaming,
    /// One transcript after the recording is complete
    Batch,
}

/// Speech-to-text configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub provider: SttProvider,
    pub mode: CaptureMode,
    pub model: String,
    pub language: String,
    /// Override the provider base URL
    pub base_url: Option<String>,
    /// Batch recordings are force-stopped after this long
    pub max_recording: Duration,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: SttProvider::Deepgram,
            mode: CaptureMode::Streaming,
            model: "nova-2".to_string(),
            language: "en".to_string(),
            base_url: None,
            max_recording: DEFAULT_MAX_RECORDING,
        }
    }
}

/// TTS provider backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    ElevenLabs,
    OpenAi,
}

/// What to do when no synthesis credential is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingCredential {
    /// Simulate playback timing without audio
    Simulate,
    /// Every utterance fails
    Fail,
}

/// Voice parameters sent to the synthesis backend
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSettings {
    pub voice_id: String,
    pub model_id: String,
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub use_speaker_boost: bool,
    pub output_format: String,
    pub speaking_rate: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice_id: "EXAVITQu4vr4xnSDxMaL".to_string(),
            model_id: "eleven_multilingual_v2".to_string(),
            stability: 0.3,
            similarity_boost: 0.5,
            style: 0.0,
            use_speaker_boost: true,
            output_format: "mp3_44100_128".to_string(),
            speaking_rate: 1.0,
        }
    }
}

/// Text-to-speech configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub provider: TtsProvider,
    pub settings: VoiceSettings,
    /// Request and play chunks one by one instead of concatenating
    pub streaming: bool,
    /// Character budget per synthesis request
    pub chunk_chars: usize,
    pub missing_credential: MissingCredential,
    /// Override the provider base URL
    pub base_url: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: TtsProvider::ElevenLabs,
            settings: VoiceSettings::default(),
            streaming: false,
            chunk_chars: DEFAULT_TTS_CHUNK_CHARS,
            missing_credential: MissingCredential::Simulate,
            base_url: None,
        }
    }
}

/// Bounds for simulated playback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedPlaybackConfig {
    pub per_char: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl Default for SimulatedPlaybackConfig {
    fn default() -> Self {
        Self {
            per_char: Duration::from_millis(50),
            min: Duration::from_millis(2000),
            max: Duration::from_millis(8000),
        }
    }
}

impl SimulatedPlaybackConfig {
    /// Simulated duration for an utterance of `text`
    #[must_use]
    pub fn duration_for(&self, text: &str) -> Duration {
        let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
        self.per_char
            .saturating_mul(chars)
            .clamp(self.min, self.max.max(self.min))
    }
}

/// API keys for external services
///
/// A missing key selects the fallback for that backend.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (chat completions, Whisper, TTS)
    pub openai: Option<SecretString>,

    /// Deepgram API key (STT)
    pub deepgram: Option<SecretString>,

    /// `ElevenLabs` API key (TTS)
    pub elevenlabs: Option<SecretString>,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Port to listen on
    pub port: u16,
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if the persona cannot be loaded
    pub fn load(persona_id: Option<&str>, config_path: Option<&Path>) -> Result<Self> {
        Self::load_with_options(persona_id, config_path, false)
    }

    /// Load configuration with explicit voice disable option
    ///
    /// # Errors
    ///
    /// Returns error if the persona cannot be loaded
    pub fn load_with_options(
        persona_id: Option<&str>,
        config_path: Option<&Path>,
        disable_voice: bool,
    ) -> Result<Self> {
        let fc = file::load_config_file(config_path);
        let mut config = Self::resolve(fc, persona_id, |key| std::env::var(key).ok())?;

        if disable_voice {
            tracing::info!("voice explicitly disabled via --disable-voice");
            config.voice.enabled = false;
        }

        Ok(config)
    }

    /// Resolve a configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the persona cannot be loaded
    #[allow(clippy::too_many_lines)]
    pub fn resolve(
        fc: file::VoiceSparkConfigFile,
        persona_id: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let env_parse = |key: &str| env(key).and_then(|v| v.parse::<u64>().ok());

        // Persona (cli > env > file path > file id > default)
        let persona = match persona_id.map(ToString::to_string).or_else(|| env("VOICESPARK_PERSONA")) {
            Some(id) => Persona::embedded(&id)?,
            None => match (&fc.persona_file, &fc.persona) {
                (Some(path), _) => Persona::from_file(path)?,
                (None, Some(id)) => Persona::embedded(id)?,
                (None, None) => Persona::embedded(DEFAULT_PERSONA_ID)?,
            },
        };

        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY")
                .or(fc.api_keys.openai)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            deepgram: env("DEEPGRAM_API_KEY")
                .or(fc.api_keys.deepgram)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            elevenlabs: env("ELEVENLABS_API_KEY")
                .or(fc.api_keys.elevenlabs)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
        };

        let fs = fc.session;
        let persona_session = SessionConfig::from_persona(&persona);
        let session = SessionConfig {
            max_user_turns: env_parse("VOICESPARK_MAX_TURNS")
                .and_then(|n| usize::try_from(n).ok())
                .or(fs.max_user_turns)
                .unwrap_or(DEFAULT_MAX_USER_TURNS)
                .max(1),
            closing_delay: fs
                .closing_delay_ms
                .map_or(DEFAULT_CLOSING_DELAY, Duration::from_millis),
            greeting: fs.greeting.unwrap_or(persona_session.greeting),
            persona_directive: fs
                .persona_directive
                .unwrap_or(persona_session.persona_directive),
            closing_directive: fs
                .closing_directive
                .unwrap_or(persona_session.closing_directive),
            auto_submit_transcript: fs.auto_submit_transcript.unwrap_or(true),
        };

        let fl = fc.llm;
        let llm_defaults = LlmConfig::default();
        let llm = LlmConfig {
            model: env("VOICESPARK_LLM_MODEL")
                .or(fl.model)
                .unwrap_or(llm_defaults.model),
            base_url: env("VOICESPARK_LLM_BASE_URL")
                .or(fl.base_url)
                .unwrap_or(llm_defaults.base_url),
            temperature: fl.temperature.unwrap_or(llm_defaults.temperature),
            max_tokens: fl.max_tokens.unwrap_or(llm_defaults.max_tokens),
            top_p: fl.top_p,
            frequency_penalty: fl.frequency_penalty,
            presence_penalty: fl.presence_penalty,
        };

        let fv = fc.voice;
        let stt_defaults = SttConfig::default();
        let stt_provider = env("VOICESPARK_STT_PROVIDER")
            .and_then(|p| parse_enum::<SttProvider>(&p))
            .or(fv.stt.provider)
            .unwrap_or(stt_defaults.provider);
        let stt = SttConfig {
            provider: stt_provider,
            mode: env("VOICESPARK_CAPTURE_MODE")
                .and_then(|m| parse_enum::<CaptureMode>(&m))
                .or(fv.stt.mode)
                .unwrap_or(stt_defaults.mode),
            model: fv.stt.model.unwrap_or_else(|| match stt_provider {
                SttProvider::Deepgram => stt_defaults.model,
                SttProvider::Whisper => "whisper-1".to_string(),
            }),
            language: fv.stt.language.unwrap_or(stt_defaults.language),
            base_url: fv.stt.base_url,
            max_recording: fv
                .stt
                .max_recording_ms
                .map_or(stt_defaults.max_recording, Duration::from_millis),
        };

        let ft = fv.tts;
        let tts_defaults = TtsConfig::default();
        let tts_provider = env("VOICESPARK_TTS_PROVIDER")
            .and_then(|p| parse_enum::<TtsProvider>(&p))
            .or(ft.provider)
            .unwrap_or(tts_defaults.provider);
        let voice_defaults = VoiceSettings::default();
        let settings = VoiceSettings {
            voice_id: ft
                .voice_id
                .or_else(|| persona.voice_id().map(ToString::to_string))
                .unwrap_or_else(|| match tts_provider {
                    TtsProvider::ElevenLabs => voice_defaults.voice_id.clone(),
                    TtsProvider::OpenAi => "alloy".to_string(),
                }),
            model_id: ft.model.unwrap_or_else(|| match tts_provider {
                TtsProvider::ElevenLabs => voice_defaults.model_id.clone(),
                TtsProvider::OpenAi => "tts-1".to_string(),
            }),
            stability: ft.stability.unwrap_or(voice_defaults.stability),
            similarity_boost: ft
                .similarity_boost
                .unwrap_or(voice_defaults.similarity_boost),
            style: ft.style.unwrap_or(voice_defaults.style),
            use_speaker_boost: ft
                .use_speaker_boost
                .unwrap_or(voice_defaults.use_speaker_boost),
            output_format: ft.output_format.unwrap_or(voice_defaults.output_format),
            speaking_rate: ft.speaking_rate.unwrap_or_else(|| persona.speaking_rate()),
        };
        let tts = TtsConfig {
            provider: tts_provider,
            settings,
            streaming: ft.streaming.unwrap_or(tts_defaults.streaming),
            chunk_chars: ft.chunk_chars.unwrap_or(tts_defaults.chunk_chars).max(1),
            missing_credential: ft
                .missing_credential
                .unwrap_or(tts_defaults.missing_credential),
            base_url: ft.base_url,
        };

        let playback_defaults = SimulatedPlaybackConfig::default();
        let playback = SimulatedPlaybackConfig {
            per_char: fv
                .playback
                .ms_per_char
                .map_or(playback_defaults.per_char, Duration::from_millis),
            min: fv
                .playback
                .min_ms
                .map_or(playback_defaults.min, Duration::from_millis),
            max: fv
                .playback
                .max_ms
                .map_or(playback_defaults.max, Duration::from_millis),
        };

        let voice = VoiceConfig {
            enabled: fv.enabled.unwrap_or(true),
            stt,
            tts,
            playback,
        };

        let api_server = ApiServerConfig {
            port: env("VOICESPARK_PORT")
                .or_else(|| env("PORT"))
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(18800),
        };

        tracing::debug!(
            persona = persona.id(),
            max_user_turns = session.max_user_turns,
            llm_credential = api_keys.openai.is_some(),
            "configuration resolved"
        );

        Ok(Self {
            persona,
            session,
            llm,
            voice,
            api_keys,
            api_server,
        })
    }

    /// Key for the configured STT provider
    #[must_use]
    pub const fn stt_key(&self) -> Option<&SecretString> {
        match self.voice.stt.provider {
            SttProvider::Deepgram => self.api_keys.deepgram.as_ref(),
            SttProvider::Whisper => self.api_keys.openai.as_ref(),
        }
    }

    /// Key for the configured TTS provider
    #[must_use]
    pub const fn tts_key(&self) -> Option<&SecretString> {
        match self.voice.tts.provider {
            TtsProvider::ElevenLabs => self.api_keys.elevenlabs.as_ref(),
            TtsProvider::OpenAi => self.api_keys.openai.as_ref(),
        }
    }
}

/// Parse a lowercase enum name from an env value
fn parse_enum<T: serde::de::DeserializeOwned>(value: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_lowercase())).ok()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let config = Config::resolve(file::VoiceSparkConfigFile::default(), None, env_from(&[]))
            .unwrap();

        assert_eq!(config.persona.id(), DEFAULT_PERSONA_ID);
        assert_eq!(config.session.max_user_turns, 5);
        assert_eq!(config.session.closing_delay, Duration::from_millis(1000));
        assert!(config.session.auto_submit_transcript);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.voice.stt.max_recording, Duration::from_millis(5000));
        assert_eq!(config.voice.tts.chunk_chars, 200);
        assert_eq!(config.voice.tts.missing_credential, MissingCredential::Simulate);
        assert!(config.api_keys.openai.is_none());
        assert!(config.tts_key().is_none());
    }

    #[test]
    fn env_overrides_file() {
        let fc: file::VoiceSparkConfigFile = toml::from_str(
            r#"
[session]
max_user_turns = 3

[api_keys]
openai = "from-file"

[server]
port = 9000
"#,
        )
        .unwrap();

        let config = Config::resolve(
            fc,
            None,
            env_from(&[
                ("OPENAI_API_KEY", "from-env"),
                ("VOICESPARK_MAX_TURNS", "7"),
                ("VOICESPARK_STT_PROVIDER", "Whisper"),
            ]),
        )
        .unwrap();

        assert_eq!(config.session.max_user_turns, 7);
        assert_eq!(config.api_server.port, 9000);
        assert_eq!(
            config.api_keys.openai.as_ref().map(|k| k.expose_secret().to_string()),
            Some("from-env".to_string())
        );
        assert_eq!(config.voice.stt.provider, SttProvider::Whisper);
        assert_eq!(config.voice.stt.model, "whisper-1");
        assert!(config.stt_key().is_some());
    }

    #[test]
    fn empty_keys_select_fallback() {
        let config = Config::resolve(
            file::VoiceSparkConfigFile::default(),
            None,
            env_from(&[("ELEVENLABS_API_KEY", "")]),
        )
        .unwrap();
        assert!(config.api_keys.elevenlabs.is_none());
    }

    #[test]
    fn persona_supplies_session_texts() {
        let config = Config::resolve(
            file::VoiceSparkConfigFile::default(),
            Some("synthia"),
            env_from(&[]),
        )
        .unwrap();

        assert!(config.session.greeting.contains("Synthia"));
        assert_eq!(config.session.persona_directive, config.persona.directive());
        assert!((config.voice.tts.settings.speaking_rate - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn simulated_duration_is_clamped() {
        let playback = SimulatedPlaybackConfig::default();
        assert_eq!(playback.duration_for("short"), Duration::from_millis(2000));
        assert_eq!(
            playback.duration_for(&"a".repeat(100)),
            Duration::from_millis(5000)
        );
        assert_eq!(
            playback.duration_for(&"a".repeat(1000)),
            Duration::from_millis(8000)
        );
    }
}
