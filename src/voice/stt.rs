//! Speech-to-text (STT) processing
//!
//! Batch transcribers turn one complete recording into a [`Transcript`].
//! A [`StreamingTranscriber`] turns a live sample stream into interim and
//! final [`TranscriptFragment`]s for one capture session.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::capture::samples_to_wav;
use crate::{Error, Result};

/// Sentiment polarity attached to a transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

/// Sentiment of a transcribed utterance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: SentimentLabel,
    /// Signed score, negative for negative sentiment
    pub score: f32,
}

/// Result of a batch transcription
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
}

impl Transcript {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sentiment: None,
        }
    }
}

/// One piece of live transcription output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptFragment {
    /// Provisional text for the segment being spoken, may be revised
    Interim(String),
    /// Settled text for a completed segment
    Final(String),
}

/// Transcribes a complete recording
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe encoded audio (`mime` is e.g. "audio/wav")
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails
    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<Transcript>;

    /// Transcriber name for logging
    fn name(&self) -> &'static str;
}

/// Live sample frames for one capture session
pub type SampleStream = Pin<Box<dyn Stream<Item = Vec<f32>> + Send>>;

/// Fragments for one capture session
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<TranscriptFragment>> + Send>>;

/// Transcribes a live sample stream
///
/// The returned stream is lazy and ends once `audio` ends and any open
/// segment has been finalized. It cannot be restarted.
pub trait StreamingTranscriber: Send + Sync {
    fn transcribe_stream(&self, audio: SampleStream, sample_rate: u32) -> FragmentStream;
}

/// Response from `OpenAI` Whisper transcription API
#[derive(Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Transcribes through the `OpenAI` Whisper API
pub struct WhisperTranscriber {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl WhisperTranscriber {
    /// Create a Whisper transcriber
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String, model: String, base_url: Option<String>) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        })
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<Transcript> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let file_name = if mime.contains("webm") {
            "audio.webm"
        } else {
            "audio.wav"
        };
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name(file_name)
                    .mime_str(mime)
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post(format!(
                "{}/audio/transcriptions",
                self.base_url.trim_end_matches('/')
            ))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                Error::Stt(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response
            .json()
            .await
            .map_err(|e| Error::Stt(format!("failed to parse Whisper response: {e}")))?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(Transcript::new(result.text.trim()))
    }

    fn name(&self) -> &'static str {
        "whisper"
    }
}

/// Response from Deepgram transcription API
#[derive(Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Deserialize)]
struct DeepgramAlternative {
    transcript: String,
    #[serde(default)]
    sentiment: Option<DeepgramSentiment>,
    sentiment_score: Option<f32>,
}

/// Sentiment as reported on an alternative
///
/// Either an object `{ sentiment, score }` or a bare label with a sibling
/// `sentiment_score`. Anything else is ignored and reads as neutral.
#[derive(Deserialize)]
#[serde(untagged)]
enum DeepgramSentiment {
    Detailed {
        sentiment: String,
        score: Option<f32>,
    },
    Label(String),
    #[allow(dead_code)]
    Unrecognized(serde::de::IgnoredAny),
}

impl DeepgramAlternative {
    fn sentiment(&self) -> Sentiment {
        let (label, score) = match &self.sentiment {
            Some(DeepgramSentiment::Detailed { sentiment, score }) => (sentiment.as_str(), *score),
            Some(DeepgramSentiment::Label(label)) => (label.as_str(), self.sentiment_score),
            Some(DeepgramSentiment::Unrecognized(_)) | None => ("", None),
        };

        let label = match label {
            "positive" => SentimentLabel::Positive,
            "negative" => SentimentLabel::Negative,
            "neutral" => SentimentLabel::Neutral,
            _ => {
                return Sentiment {
                    label: SentimentLabel::Neutral,
                    score: 0.0,
                };
            }
        };
        Sentiment {
            label,
            score: score.unwrap_or(0.0),
        }
    }
}

/// Transcribes through the Deepgram listen API with sentiment analysis
pub struct DeepgramTranscriber {
    client: reqwest::Client,
    api_key: String,
    model: String,
    language: String,
    base_url: String,
}

impl DeepgramTranscriber {
    /// Create a Deepgram transcriber
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(
        api_key: String,
        model: String,
        language: String,
        base_url: Option<String>,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Deepgram API key required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            language,
            base_url: base_url.unwrap_or_else(|| "https://api.deepgram.com/v1".to_string()),
        })
    }
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<Transcript> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        let url = format!("{}/listen", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .query(&[
                ("model", self.model.as_str()),
                ("language", self.language.as_str()),
                ("punctuate", "true"),
                ("smart_format", "true"),
                ("sentiment", "true"),
            ])
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", mime)
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Deepgram request failed");
                Error::Stt(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response
            .json()
            .await
            .map_err(|e| Error::Stt(format!("failed to parse Deepgram response: {e}")))?;

        let Some(alternative) = result
            .results
            .channels
            .into_iter()
            .next()
            .and_then(|c| c.alternatives.into_iter().next())
        else {
            return Ok(Transcript::new(""));
        };

        let sentiment = alternative.sentiment();

        tracing::info!(
            transcript = %alternative.transcript,
            sentiment = ?sentiment.label,
            "transcription complete"
        );
        Ok(Transcript {
            text: alternative.transcript.trim().to_string(),
            sentiment: Some(sentiment),
        })
    }

    fn name(&self) -> &'static str {
        "deepgram"
    }
}

/// Canned caregiver questions used when no STT credential is configured
pub const FALLBACK_TRANSCRIPTS: &[(&str, SentimentLabel, f32)] = &[
    (
        "How can I help my mom with sundowning?",
        SentimentLabel::Neutral,
        0.1,
    ),
    (
        "What are some tips for medication management?",
        SentimentLabel::Neutral,
        0.2,
    ),
    (
        "I'm feeling really overwhelmed with all these caregiving responsibilities.",
        SentimentLabel::Negative,
        -0.7,
    ),
    (
        "We had a great day today, she remembered my name!",
        SentimentLabel::Positive,
        0.8,
    ),
    (
        "How can I deal with caregiver stress?",
        SentimentLabel::Negative,
        -0.4,
    ),
];

/// Credential-free transcriber that cycles through canned questions
pub struct FallbackTranscriber {
    next: AtomicUsize,
    latency: Duration,
}

impl FallbackTranscriber {
    #[must_use]
    pub const fn new(latency: Duration) -> Self {
        Self {
            next: AtomicUsize::new(0),
            latency,
        }
    }
}

impl Default for FallbackTranscriber {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

#[async_trait]
impl Transcriber for FallbackTranscriber {
    async fn transcribe(&self, audio: &[u8], _mime: &str) -> Result<Transcript> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % FALLBACK_TRANSCRIPTS.len();
        let (text, label, score) = FALLBACK_TRANSCRIPTS[index];
        tracing::debug!(audio_bytes = audio.len(), index, "fallback transcription");

        Ok(Transcript {
            text: text.to_string(),
            sentiment: Some(Sentiment { label, score }),
        })
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}

/// Minimum RMS energy considered speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum segment length worth transcribing
const MIN_SPEECH: Duration = Duration::from_millis(300);

/// Silence that closes a segment
const SEGMENT_SILENCE: Duration = Duration::from_millis(500);

/// Interval between interim re-transcriptions of the open segment
const INTERIM_INTERVAL: Duration = Duration::from_millis(1000);

/// Outcome of feeding one frame to the segmenter
#[derive(Debug, PartialEq)]
pub enum SegmentEvent {
    /// Nothing to report
    None,
    /// The open segment has grown by another interim interval
    Progress,
    /// A segment closed on silence
    Closed(Vec<f32>),
}

/// Energy-based voice activity segmentation
#[derive(Debug)]
pub struct SpeechSegmenter {
    speaking: bool,
    buffer: Vec<f32>,
    silence: usize,
    since_progress: usize,
    min_speech: usize,
    silence_limit: usize,
    interim_every: usize,
}

impl SpeechSegmenter {
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        let samples = |d: Duration| {
            usize::try_from(u128::from(sample_rate) * d.as_millis() / 1000).unwrap_or(usize::MAX)
        };

        Self {
            speaking: false,
            buffer: Vec::new(),
            silence: 0,
            since_progress: 0,
            min_speech: samples(MIN_SPEECH),
            silence_limit: samples(SEGMENT_SILENCE),
            interim_every: samples(INTERIM_INTERVAL),
        }
    }

    /// Feed one frame of samples
    pub fn push(&mut self, samples: &[f32]) -> SegmentEvent {
        let is_speech = calculate_energy(samples) > ENERGY_THRESHOLD;

        if !self.speaking {
            if is_speech {
                self.speaking = true;
                self.buffer.clear();
                self.buffer.extend_from_slice(samples);
                self.silence = 0;
                self.since_progress = samples.len();
                tracing::trace!("speech detected, segment opened");
            }
            return SegmentEvent::None;
        }

        self.buffer.extend_from_slice(samples);
        self.since_progress += samples.len();
        if is_speech {
            self.silence = 0;
        } else {
            self.silence += samples.len();
        }

        if self.silence > self.silence_limit {
            let segment = std::mem::take(&mut self.buffer);
            self.reset();
            if segment.len() > self.min_speech + self.silence_limit {
                tracing::debug!(samples = segment.len(), "speech segment complete");
                return SegmentEvent::Closed(segment);
            }
            tracing::trace!("segment too short, discarded");
            return SegmentEvent::None;
        }

        if self.since_progress >= self.interim_every {
            self.since_progress = 0;
            return SegmentEvent::Progress;
        }

        SegmentEvent::None
    }

    /// Samples of the open segment
    #[must_use]
    pub fn open_segment(&self) -> &[f32] {
        &self.buffer
    }

    /// Close the open segment at end of input
    pub fn finish(&mut self) -> Option<Vec<f32>> {
        let segment = std::mem::take(&mut self.buffer);
        let was_speaking = self.speaking;
        self.reset();
        (was_speaking && segment.len() > self.min_speech).then_some(segment)
    }

    fn reset(&mut self) {
        self.speaking = false;
        self.buffer.clear();
        self.silence = 0;
        self.since_progress = 0;
    }
}

/// Live transcription built on voice activity segmentation over a batch transcriber
///
/// Interim fragments come from re-transcribing the open segment; a final
/// fragment is produced whenever a segment closes on silence or input ends.
pub struct SegmentingTranscriber {
    inner: Arc<dyn Transcriber>,
}

impl SegmentingTranscriber {
    #[must_use]
    pub fn new(inner: Arc<dyn Transcriber>) -> Self {
        Self { inner }
    }
}

impl StreamingTranscriber for SegmentingTranscriber {
    fn transcribe_stream(&self, mut audio: SampleStream, sample_rate: u32) -> FragmentStream {
        let (tx, rx) = mpsc::channel(16);
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let mut segmenter = SpeechSegmenter::new(sample_rate);

            while let Some(frame) = audio.next().await {
                let fragment = match segmenter.push(&frame) {
                    SegmentEvent::None => continue,
                    SegmentEvent::Progress => {
                        transcribe_samples(inner.as_ref(), segmenter.open_segment(), sample_rate)
                            .await
                            .map(|t| t.map(TranscriptFragment::Interim))
                    }
                    SegmentEvent::Closed(segment) => {
                        transcribe_samples(inner.as_ref(), &segment, sample_rate)
                            .await
                            .map(|t| t.map(TranscriptFragment::Final))
                    }
                };

                if let Some(fragment) = fragment.transpose() {
                    let failed = fragment.is_err();
                    if tx.send(fragment).await.is_err() || failed {
                        return;
                    }
                }
            }

            if let Some(segment) = segmenter.finish() {
                let fragment = transcribe_samples(inner.as_ref(), &segment, sample_rate)
                    .await
                    .map(|t| t.map(TranscriptFragment::Final));
                if let Some(fragment) = fragment.transpose() {
                    let _ = tx.send(fragment).await;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

/// Encode and transcribe raw samples, `None` when nothing was recognized
async fn transcribe_samples(
    transcriber: &dyn Transcriber,
    samples: &[f32],
    sample_rate: u32,
) -> Result<Option<String>> {
    let wav = samples_to_wav(samples, sample_rate)?;
    let transcript = transcriber.transcribe(&wav, "audio/wav").await?;
    let text = transcript.text.trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
pub(crate) fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;

    fn loud(ms: usize) -> Vec<f32> {
        vec![0.5; RATE as usize / 1000 * ms]
    }

    fn quiet(ms: usize) -> Vec<f32> {
        vec![0.0; RATE as usize / 1000 * ms]
    }

    #[test]
    fn test_energy_calculation() {
        assert!(calculate_energy(&quiet(10)) < 0.001);
        assert!(calculate_energy(&loud(10)) > 0.4);
        assert!(calculate_energy(&[]) < f32::EPSILON);
    }

    #[test]
    fn segment_closes_after_silence() {
        let mut segmenter = SpeechSegmenter::new(RATE);
        let mut closed = None;

        for _ in 0..8 {
            assert_eq!(segmenter.push(&loud(100)), SegmentEvent::None);
        }
        for _ in 0..6 {
            if let SegmentEvent::Closed(segment) = segmenter.push(&quiet(100)) {
                closed = Some(segment);
                break;
            }
        }

        let segment = closed.unwrap();
        assert!(segment.len() >= loud(800).len());
        assert!(segmenter.open_segment().is_empty());
    }

    #[test]
    fn short_noise_is_discarded() {
        let mut segmenter = SpeechSegmenter::new(RATE);
        segmenter.push(&loud(50));
        for _ in 0..10 {
            assert!(!matches!(
                segmenter.push(&quiet(100)),
                SegmentEvent::Closed(_)
            ));
        }
        assert!(segmenter.finish().is_none());
    }

    #[test]
    fn reports_progress_on_long_segments() {
        let mut segmenter = SpeechSegmenter::new(RATE);
        let events: Vec<SegmentEvent> = (0..12).map(|_| segmenter.push(&loud(100))).collect();
        assert_eq!(
            events.iter().filter(|e| **e == SegmentEvent::Progress).count(),
            1
        );
    }

    #[test]
    fn finish_flushes_open_segment() {
        let mut segmenter = SpeechSegmenter::new(RATE);
        for _ in 0..5 {
            segmenter.push(&loud(100));
        }
        assert_eq!(segmenter.finish().map(|s| s.len()), Some(loud(500).len()));
    }

    #[tokio::test]
    async fn fallback_cycles_canned_questions() {
        let transcriber = FallbackTranscriber::new(Duration::ZERO);
        let first = transcriber.transcribe(&[], "audio/wav").await.unwrap();
        let second = transcriber.transcribe(&[], "audio/wav").await.unwrap();

        assert_eq!(first.text, FALLBACK_TRANSCRIPTS[0].0);
        assert_eq!(second.text, FALLBACK_TRANSCRIPTS[1].0);
        assert_eq!(
            first.sentiment.map(|s| s.label),
            Some(SentimentLabel::Neutral)
        );
    }

    #[tokio::test]
    async fn segmenting_transcriber_emits_final_per_segment() {
        let inner: Arc<dyn Transcriber> = Arc::new(FallbackTranscriber::new(Duration::ZERO));
        let streaming = SegmentingTranscriber::new(inner);

        let mut frames: Vec<Vec<f32>> = Vec::new();
        frames.extend((0..3).map(|_| loud(100)));
        frames.extend((0..7).map(|_| quiet(100)));
        frames.extend((0..5).map(|_| loud(100)));

        let audio: SampleStream = Box::pin(futures::stream::iter(frames));
        let fragments: Vec<TranscriptFragment> = streaming
            .transcribe_stream(audio, RATE)
            .map(|f| f.unwrap())
            .collect()
            .await;

        assert_eq!(
            fragments,
            vec![
                TranscriptFragment::Final(FALLBACK_TRANSCRIPTS[0].0.to_string()),
                TranscriptFragment::Final(FALLBACK_TRANSCRIPTS[1].0.to_string()),
            ]
        );
    }
}
