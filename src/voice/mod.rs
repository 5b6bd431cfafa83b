//! Voice processing module
//!
//! Handles audio capture, transcription, synthesis and playback. Every
//! external backend sits behind a trait so that the session can run against
//! fallbacks or test doubles.

mod capture;
mod playback;
mod stt;
mod tts;

use std::sync::Arc;

use secrecy::ExposeSecret;

pub use capture::{
    AudioInput, AudioSource, CaptureBackend, CaptureEvent, CapturePhase, CpalMicrophone,
    SAMPLE_RATE, SpeechCapture, samples_to_wav,
};
pub use playback::{
    AudioOutput, CpalOutput, DecodedAudio, PlaybackController, PlaybackEvent, Speaker, decode_mp3,
};
pub use stt::{
    DeepgramTranscriber, FALLBACK_TRANSCRIPTS, FallbackTranscriber, FragmentStream, SampleStream,
    SegmentEvent, SegmentingTranscriber, Sentiment, SentimentLabel, SpeechSegmenter,
    StreamingTranscriber, Transcriber, Transcript, TranscriptFragment, WhisperTranscriber,
};
pub use tts::{
    AudioByteStream, ElevenLabsSynthesizer, OpenAiSynthesizer, Synthesizer, chunk_text,
    collect_audio, synthesize_all,
};

use crate::config::{CaptureMode, SttProvider};
use crate::{Config, Result};

/// Build the batch transcriber selected by the configuration
///
/// Without a credential for the configured provider the canned fallback is used.
///
/// # Errors
///
/// Returns error if the transcriber cannot be constructed
pub fn transcriber_from_config(config: &Config) -> Result<Arc<dyn Transcriber>> {
    let stt = &config.voice.stt;
    let Some(key) = config.stt_key() else {
        tracing::info!("no transcription credential, using fallback transcriber");
        return Ok(Arc::new(FallbackTranscriber::default()));
    };
    let key = key.expose_secret().to_string();

    let transcriber: Arc<dyn Transcriber> = match stt.provider {
        SttProvider::Deepgram => Arc::new(DeepgramTranscriber::new(
            key,
            stt.model.clone(),
            stt.language.clone(),
            stt.base_url.clone(),
        )?),
        SttProvider::Whisper => Arc::new(WhisperTranscriber::new(
            key,
            stt.model.clone(),
            stt.base_url.clone(),
        )?),
    };
    tracing::info!(transcriber = transcriber.name(), "transcription enabled");
    Ok(transcriber)
}

/// Capture backend for the configured capture mode
#[must_use]
pub fn capture_backend(config: &Config, transcriber: Arc<dyn Transcriber>) -> CaptureBackend {
    match config.voice.stt.mode {
        CaptureMode::Streaming => {
            CaptureBackend::Streaming(Arc::new(SegmentingTranscriber::new(transcriber)))
        }
        CaptureMode::Batch => CaptureBackend::Batch {
            transcriber,
            max_recording: config.voice.stt.max_recording,
        },
    }
}

/// Build the synthesizer selected by the configuration, `None` without a credential
///
/// # Errors
///
/// Returns error if the synthesizer cannot be constructed
pub fn synthesizer_from_config(config: &Config) -> Result<Option<Arc<dyn Synthesizer>>> {
    tts::from_config(config)
}
