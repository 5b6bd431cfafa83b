//! Text-to-speech (TTS) processing

use std::pin::Pin;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use regex::Regex;
use serde::Serialize;

use crate::config::VoiceSettings;
use crate::{Error, Result};

/// Audio bytes delivered incrementally
pub type AudioByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Synthesizes speech from text
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize one chunk of text into MP3 bytes
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    async fn synthesize(&self, text: &str, settings: &VoiceSettings) -> Result<Bytes>;

    /// Synthesize one chunk of text as a byte stream
    ///
    /// Backends without a streaming endpoint yield the batch result as a
    /// single item.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started
    async fn synthesize_stream(
        &self,
        text: &str,
        settings: &VoiceSettings,
    ) -> Result<AudioByteStream> {
        let audio = self.synthesize(text, settings).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(audio) })))
    }

    /// Synthesizer name for logging
    fn name(&self) -> &'static str;
}

static SENTENCE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[^.!?]+[.!?]+").ok());

/// Split text at sentence boundaries into chunks of at most `max_chars`
///
/// Sentences are never split, so a single sentence longer than the budget
/// becomes its own chunk. Trailing text without terminal punctuation is kept.
#[must_use]
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut sentences: Vec<&str> = Vec::new();
    let mut consumed = 0;
    if let Some(re) = SENTENCE.as_ref() {
        for m in re.find_iter(text) {
            sentences.push(m.as_str());
            consumed = m.end();
        }
    }
    let rest = &text[consumed..];
    if !rest.trim().is_empty() {
        sentences.push(rest);
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for sentence in sentences {
        if current.chars().count() + sentence.chars().count() <= max_chars {
            current.push_str(sentence);
        } else {
            if !current.trim().is_empty() {
                chunks.push(current.trim().to_string());
            }
            current = sentence.to_string();
        }
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }

    chunks
}

/// Synthesize `text` chunk by chunk and concatenate the audio in order
///
/// # Errors
///
/// Returns the first chunk failure
pub async fn synthesize_all(
    synthesizer: &dyn Synthesizer,
    text: &str,
    settings: &VoiceSettings,
    chunk_chars: usize,
) -> Result<Vec<u8>> {
    let mut audio = Vec::new();
    for chunk in chunk_text(text, chunk_chars) {
        let bytes = synthesizer.synthesize(&chunk, settings).await?;
        audio.extend_from_slice(&bytes);
    }

    tracing::debug!(
        synthesizer = synthesizer.name(),
        chars = text.len(),
        audio_bytes = audio.len(),
        "synthesis complete"
    );
    Ok(audio)
}

/// Synthesizes through the `ElevenLabs` text-to-speech API
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct ElevenLabsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: ElevenLabsVoiceSettings,
}

#[derive(Serialize)]
struct ElevenLabsVoiceSettings {
    stability: f32,
    similarity_boost: f32,
    style: f32,
    use_speaker_boost: bool,
    speed: f32,
}

impl ElevenLabsSynthesizer {
    /// Create an `ElevenLabs` synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String, base_url: Option<String>) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.elevenlabs.io/v1".to_string()),
        })
    }

    async fn post(
        &self,
        path_suffix: &str,
        text: &str,
        settings: &VoiceSettings,
    ) -> Result<reqwest::Response> {
        let url = format!(
            "{}/text-to-speech/{}{path_suffix}",
            self.base_url.trim_end_matches('/'),
            settings.voice_id
        );

        let request = ElevenLabsRequest {
            text,
            model_id: &settings.model_id,
            voice_settings: ElevenLabsVoiceSettings {
                stability: settings.stability,
                similarity_boost: settings.similarity_boost,
                style: settings.style,
                use_speaker_boost: settings.use_speaker_boost,
                speed: settings.speaking_rate,
            },
        };

        let response = self
            .client
            .post(&url)
            .query(&[("output_format", settings.output_format.as_str())])
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Tts(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "ElevenLabs API error");
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        Ok(response)
    }
}

#[async_trait]
impl Synthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str, settings: &VoiceSettings) -> Result<Bytes> {
        let response = self.post("", text, settings).await?;
        response.bytes().await.map_err(|e| Error::Tts(e.to_string()))
    }

    async fn synthesize_stream(
        &self,
        text: &str,
        settings: &VoiceSettings,
    ) -> Result<AudioByteStream> {
        let response = self.post("/stream", text, settings).await?;
        Ok(Box::pin(
            response
                .bytes_stream()
                .map_err(|e| Error::Tts(e.to_string())),
        ))
    }

    fn name(&self) -> &'static str {
        "elevenlabs"
    }
}

/// Synthesizes through the `OpenAI` speech API
pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiSynthesizer {
    /// Create an `OpenAI` synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String, base_url: Option<String>) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        })
    }
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str, settings: &VoiceSettings) -> Result<Bytes> {
        #[derive(Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &settings.model_id,
            input: text,
            voice: &settings.voice_id,
            speed: settings.speaking_rate,
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Tts(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        response.bytes().await.map_err(|e| Error::Tts(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Collect a byte stream into one buffer
///
/// # Errors
///
/// Returns the first stream error
pub async fn collect_audio(mut stream: AudioByteStream) -> Result<Vec<u8>> {
    let mut audio = Vec::new();
    while let Some(chunk) = stream.next().await {
        audio.extend_from_slice(&chunk?);
    }
    Ok(audio)
}

/// Build the synthesizer selected by the configuration, `None` without a credential
///
/// # Errors
///
/// Returns error if the synthesizer cannot be constructed
pub fn from_config(config: &crate::Config) -> Result<Option<Arc<dyn Synthesizer>>> {
    use secrecy::ExposeSecret;

    let Some(key) = config.tts_key() else {
        tracing::info!("no synthesis credential configured");
        return Ok(None);
    };
    let key = key.expose_secret().to_string();
    let base_url = config.voice.tts.base_url.clone();

    let synthesizer: Arc<dyn Synthesizer> = match config.voice.tts.provider {
        crate::config::TtsProvider::ElevenLabs => {
            Arc::new(ElevenLabsSynthesizer::new(key, base_url)?)
        }
        crate::config::TtsProvider::OpenAi => Arc::new(OpenAiSynthesizer::new(key, base_url)?),
    };
    tracing::info!(synthesizer = synthesizer.name(), "speech synthesis enabled");
    Ok(Some(synthesizer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_respect_sentence_budget() {
        let text = "First sentence here. Second one! Third, a question? Fourth.";
        let chunks = chunk_text(text, 40);

        assert_eq!(
            chunks,
            vec![
                "First sentence here. Second one!",
                "Third, a question? Fourth."
            ]
        );
        assert!(chunks.iter().all(|c| c.chars().count() <= 40));
    }

    #[test]
    fn keeps_unpunctuated_tail() {
        assert_eq!(
            chunk_text("Hello there. and then some", 200),
            vec!["Hello there. and then some"]
        );
        assert_eq!(chunk_text("no punctuation at all", 200), vec!["no punctuation at all"]);
    }

    #[test]
    fn oversized_sentence_is_its_own_chunk() {
        let long = format!("{}.", "a".repeat(50));
        let text = format!("Hi. {long} Bye.");
        let chunks = chunk_text(&text, 20);
        assert_eq!(chunks, vec!["Hi.".to_string(), long, "Bye.".to_string()]);
    }

    #[test]
    fn blank_text_has_no_chunks() {
        assert!(chunk_text("   ", 200).is_empty());
    }
}
