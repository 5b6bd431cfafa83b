//! Audio playback to speakers and the playback controller
//!
//! [`PlaybackController`] keeps at most one utterance in flight. Starting a
//! new one cancels the previous one, whose completion is then reported under
//! its own (superseded) utterance id.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::tts::{Synthesizer, chunk_text, collect_audio, synthesize_all};
use crate::config::{MissingCredential, SimulatedPlaybackConfig, TtsConfig, VoiceSettings};
use crate::{Error, Result};

/// PCM audio decoded from MP3
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Mono samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Playback length
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let millis = self.samples.len() as u64 * 1000 / u64::from(self.sample_rate);
        Duration::from_millis(millis)
    }
}

/// Decode MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if the data is not decodable MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if sample_rate == 0 {
                    sample_rate = u32::try_from(frame.sample_rate).unwrap_or(0);
                }
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(minimp3::Error::SkippedData) => {}
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 && !mp3_data.is_empty() {
        return Err(Error::Playback("no MP3 frames found".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Audio output device
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play audio until it ends or `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot play
    async fn play(&self, audio: DecodedAudio, cancel: CancellationToken) -> Result<()>;
}

/// The default output device via cpal
///
/// Each playback runs its (non-`Send`) stream on a dedicated thread; the
/// stream and the decoded buffer are released when the thread ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutput;

impl CpalOutput {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioOutput for CpalOutput {
    async fn play(&self, audio: DecodedAudio, cancel: CancellationToken) -> Result<()> {
        if audio.samples.is_empty() {
            return Ok(());
        }

        let (done_tx, done_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("voicespark-playback".to_string())
            .spawn(move || {
                let _ = done_tx.send(play_blocking(audio, &cancel));
            })
            .map_err(|e| Error::Playback(format!("failed to spawn playback thread: {e}")))?;

        done_rx
            .await
            .map_err(|_| Error::Playback("playback thread exited".to_string()))?
    }
}

/// Find an output config at `sample_rate`, mono first, then stereo
fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let rate = SampleRate(sample_rate);
    let configs = || {
        device
            .supported_output_configs()
            .map_err(|e| Error::Playback(e.to_string()))
    };

    let supported = configs()?
        .find(|c| c.channels() == 1 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .or_else(|| {
            configs().ok()?.find(|c| {
                c.channels() == 2 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
            })
        })
        .ok_or_else(|| Error::Playback("no suitable output config found".to_string()))?;

    Ok(supported.with_sample_rate(rate).config())
}

/// Play samples on the calling thread, polling for completion or cancellation
fn play_blocking(audio: DecodedAudio, cancel: &CancellationToken) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Playback("no output device available".to_string()))?;

    let config = output_config(&device, audio.sample_rate)?;
    let channels = usize::from(config.channels.max(1));
    let duration = audio.duration();
    let sample_count = audio.samples.len();

    let finished = Arc::new(AtomicBool::new(false));
    let failed = Arc::new(Mutex::new(None::<String>));
    let finished_cb = Arc::clone(&finished);
    let failed_cb = Arc::clone(&failed);

    let samples = audio.samples;
    let mut position = 0usize;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(position).copied().unwrap_or(0.0);
                    frame.fill(sample);
                    position = position.saturating_add(1);
                }
                if position >= samples.len() {
                    finished_cb.store(true, Ordering::Release);
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio playback error");
                *failed_cb.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
            },
            None,
        )
        .map_err(|e| Error::Playback(e.to_string()))?;

    stream.play().map_err(|e| Error::Playback(e.to_string()))?;

    let start = Instant::now();
    let timeout = duration + Duration::from_millis(500);
    while !finished.load(Ordering::Acquire) && !cancel.is_cancelled() {
        if failed.lock().unwrap_or_else(PoisonError::into_inner).is_some() || start.elapsed() > timeout
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    if !cancel.is_cancelled() {
        // Let the device drain its last buffer
        std::thread::sleep(Duration::from_millis(100));
    }
    drop(stream);

    if let Some(message) = failed.lock().unwrap_or_else(PoisonError::into_inner).take() {
        return Err(Error::Playback(message));
    }

    tracing::debug!(
        samples = sample_count,
        cancelled = cancel.is_cancelled(),
        "playback complete"
    );
    Ok(())
}

/// Text to audible speech: synthesis, decode, output
///
/// Without a synthesizer the configured missing-credential policy applies;
/// without an output device playback is simulated from the text length.
pub struct Speaker {
    synthesizer: Option<Arc<dyn Synthesizer>>,
    output: Option<Arc<dyn AudioOutput>>,
    settings: VoiceSettings,
    streaming: bool,
    chunk_chars: usize,
    missing_credential: MissingCredential,
    simulated: SimulatedPlaybackConfig,
}

impl Speaker {
    #[must_use]
    pub fn new(
        synthesizer: Option<Arc<dyn Synthesizer>>,
        output: Option<Arc<dyn AudioOutput>>,
        tts: &TtsConfig,
        simulated: SimulatedPlaybackConfig,
    ) -> Self {
        Self {
            synthesizer,
            output,
            settings: tts.settings.clone(),
            streaming: tts.streaming,
            chunk_chars: tts.chunk_chars,
            missing_credential: tts.missing_credential,
            simulated,
        }
    }

    /// A speaker that only simulates playback timing
    #[must_use]
    pub fn simulated(simulated: SimulatedPlaybackConfig) -> Self {
        Self::new(None, None, &TtsConfig::default(), simulated)
    }

    /// Whether real synthesis is available
    #[must_use]
    pub fn has_synthesizer(&self) -> bool {
        self.synthesizer.is_some()
    }

    /// Speak `text`, returning when playback ends or `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns error if synthesis, decoding or playback fails, or when no
    /// credential is configured and the policy is to fail
    pub async fn speak(&self, text: &str, cancel: &CancellationToken) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }

        let Some(synthesizer) = &self.synthesizer else {
            return match self.missing_credential {
                MissingCredential::Simulate => {
                    self.simulate(text, cancel).await;
                    Ok(())
                }
                MissingCredential::Fail => Err(Error::Tts(
                    "no synthesis credential configured".to_string(),
                )),
            };
        };

        let Some(output) = &self.output else {
            self.simulate(text, cancel).await;
            return Ok(());
        };

        if self.streaming {
            for chunk in chunk_text(text, self.chunk_chars) {
                let audio = tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    audio = async {
                        let stream = synthesizer.synthesize_stream(&chunk, &self.settings).await?;
                        collect_audio(stream).await
                    } => audio?,
                };
                output.play(decode_mp3(&audio)?, cancel.clone()).await?;
                if cancel.is_cancelled() {
                    return Ok(());
                }
            }
            return Ok(());
        }

        let audio = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            audio = synthesize_all(synthesizer.as_ref(), text, &self.settings, self.chunk_chars) => audio?,
        };
        output.play(decode_mp3(&audio)?, cancel.clone()).await
    }

    async fn simulate(&self, text: &str, cancel: &CancellationToken) {
        let duration = self.simulated.duration_for(text);
        tracing::debug!(
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "simulating playback"
        );
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(duration) => {}
        }
    }
}

/// Playback lifecycle notification, keyed by utterance id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started { utterance: u64 },
    Finished { utterance: u64 },
    Failed { utterance: u64, message: String },
}

impl PlaybackEvent {
    #[must_use]
    pub const fn utterance(&self) -> u64 {
        match self {
            Self::Started { utterance }
            | Self::Finished { utterance }
            | Self::Failed { utterance, .. } => *utterance,
        }
    }
}

/// Runs one utterance at a time; a new utterance supersedes the current one
pub struct PlaybackController {
    speaker: Arc<Speaker>,
    current: Mutex<Option<CancellationToken>>,
    next_utterance: AtomicU64,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl PlaybackController {
    /// Create a controller; events are delivered on the returned receiver
    #[must_use]
    pub fn new(speaker: Arc<Speaker>) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let controller = Self {
            speaker,
            current: Mutex::new(None),
            next_utterance: AtomicU64::new(1),
            events,
        };
        (controller, rx)
    }

    /// Start speaking `text` in the background, returning the utterance id
    ///
    /// `Started` is emitted before this returns.
    pub fn play(&self, text: String) -> u64 {
        let utterance = self.next_utterance.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        if let Some(previous) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(cancel.clone())
        {
            previous.cancel();
            tracing::debug!(utterance, "superseding previous utterance");
        }

        let _ = self.events.send(PlaybackEvent::Started { utterance });

        let speaker = Arc::clone(&self.speaker);
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = match speaker.speak(&text, &cancel).await {
                Ok(()) => PlaybackEvent::Finished { utterance },
                Err(e) => {
                    tracing::debug!(utterance, error = %e, "utterance failed");
                    PlaybackEvent::Failed {
                        utterance,
                        message: e.to_string(),
                    }
                }
            };
            let _ = events.send(event);
        });

        utterance
    }

    /// Cancel the current utterance, if any
    pub fn cancel(&self) {
        if let Some(current) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            current.cancel();
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.cancel();
    }
}
