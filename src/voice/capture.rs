//! Audio capture from microphone and the speech capture controller
//!
//! [`SpeechCapture`] owns at most one recording at a time. The microphone is
//! held by an [`AudioInput`] guard that releases it on drop, so every exit
//! path of the recording worker gives the device back.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::stt::{StreamingTranscriber, Transcriber, TranscriptFragment};
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Frames buffered between the device callback and the recording worker
const FRAME_BUFFER: usize = 256;

/// An acquired microphone delivering sample frames
///
/// Dropping the input releases the device.
pub struct AudioInput {
    frames: mpsc::Receiver<Result<Vec<f32>>>,
    sample_rate: u32,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl AudioInput {
    /// Wrap a frame channel; `release` runs exactly once when the input is dropped
    #[must_use]
    pub fn new(
        frames: mpsc::Receiver<Result<Vec<f32>>>,
        sample_rate: u32,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            frames,
            sample_rate,
            release: Some(Box::new(release)),
        }
    }

    /// Next frame, `None` once the device stops delivering
    pub async fn next_frame(&mut self) -> Option<Result<Vec<f32>>> {
        self.frames.recv().await
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for AudioInput {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            tracing::debug!("microphone released");
        }
    }
}

/// Source of microphone input
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Acquire the microphone and start delivering frames
    ///
    /// # Errors
    ///
    /// Returns `MicrophonePermission` when access is refused and
    /// `CaptureUnsupported` when no usable input device exists
    async fn open(&self) -> Result<AudioInput>;
}

/// The default input device via cpal
///
/// cpal streams are not `Send`, so each acquisition runs its stream on a
/// dedicated thread that lives until the [`AudioInput`] is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioSource for CpalMicrophone {
    async fn open(&self) -> Result<AudioInput> {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("voicespark-mic".to_string())
            .spawn(move || run_input_stream(&frame_tx, ready_tx, &stop_rx))
            .map_err(|e| Error::Audio(format!("failed to spawn capture thread: {e}")))?;

        let sample_rate = ready_rx
            .await
            .map_err(|_| Error::Capture("capture thread exited during startup".to_string()))??;

        Ok(AudioInput::new(frame_rx, sample_rate, move || drop(stop_tx)))
    }
}

/// Build and run the input stream until `stop` disconnects
fn run_input_stream(
    frames: &mpsc::Sender<Result<Vec<f32>>>,
    ready: oneshot::Sender<Result<u32>>,
    stop: &std::sync::mpsc::Receiver<()>,
) {
    let stream = match build_input_stream(frames.clone()) {
        Ok((stream, sample_rate)) => {
            let _ = ready.send(Ok(sample_rate));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Blocks until the AudioInput drops its sender
    let _ = stop.recv();
    drop(stream);
    tracing::debug!("audio capture stopped");
}

fn build_input_stream(frames: mpsc::Sender<Result<Vec<f32>>>) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::CaptureUnsupported("no input device available".to_string()))?;

    let supported = device
        .supported_input_configs()
        .map_err(|e| classify_device_error(&e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        });

    let config: StreamConfig = match supported {
        Some(c) => c.with_sample_rate(SampleRate(SAMPLE_RATE)).config(),
        None => device
            .default_input_config()
            .map_err(|e| classify_device_error(&e.to_string()))?
            .config(),
    };

    let channels = usize::from(config.channels.max(1));
    let sample_rate = config.sample_rate.0;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio capture initialized"
    );

    let error_frames = frames.clone();
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if frames.try_send(Ok(downmix(data, channels))).is_err() {
                    tracing::trace!("capture frame dropped");
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                let _ = error_frames.try_send(Err(Error::Capture(err.to_string())));
            },
            None,
        )
        .map_err(|e| classify_device_error(&e.to_string()))?;

    stream
        .play()
        .map_err(|e| classify_device_error(&e.to_string()))?;

    tracing::debug!("audio capture started");
    Ok((stream, sample_rate))
}

/// Average interleaved channels into mono
#[allow(clippy::cast_precision_loss)]
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Map a host error message onto the capture error taxonomy
fn classify_device_error(message: &str) -> Error {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed")
    {
        Error::MicrophonePermission(message.to_string())
    } else if lower.contains("not available") || lower.contains("not supported") {
        Error::CaptureUnsupported(message.to_string())
    } else {
        Error::Capture(message.to_string())
    }
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Lifecycle of the capture controller
///
/// `Starting` and `Stopping` are transitions; while in them every
/// start/stop request is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CapturePhase {
    Idle,
    Starting,
    Recording,
    Stopping,
}

/// Notification from the capture controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Recording began (`true`) or ended (`false`); once each per recording
    Recording(bool),
    /// Accumulated text plus the current interim fragment
    Preview(String),
    /// Accumulated settled text
    Transcript(String),
    /// Definitive transcript, sent at most once per recording and never blank
    Final(String),
    /// Capture or transcription failed; the recording ends
    Error(String),
}

/// How recorded audio becomes text
#[derive(Clone)]
pub enum CaptureBackend {
    /// Live fragments while recording
    Streaming(Arc<dyn StreamingTranscriber>),
    /// Buffered samples transcribed once the recording ends
    Batch {
        transcriber: Arc<dyn Transcriber>,
        max_recording: Duration,
    },
}

struct ActiveRecording {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct CaptureState {
    phase: CapturePhase,
    active: Option<ActiveRecording>,
}

/// Speech capture controller
pub struct SpeechCapture {
    source: Arc<dyn AudioSource>,
    backend: CaptureBackend,
    state: Arc<Mutex<CaptureState>>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    closed: CancellationToken,
}

impl SpeechCapture {
    /// Create a controller; events are delivered on the returned receiver
    #[must_use]
    pub fn new(
        source: Arc<dyn AudioSource>,
        backend: CaptureBackend,
    ) -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let capture = Self {
            source,
            backend,
            state: Arc::new(Mutex::new(CaptureState {
                phase: CapturePhase::Idle,
                active: None,
            })),
            events,
            closed: CancellationToken::new(),
        };
        (capture, rx)
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> CapturePhase {
        self.lock().phase
    }

    /// Whether a recording is in progress
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.phase() == CapturePhase::Recording
    }

    /// Begin a recording
    ///
    /// Returns `Ok(false)` without side effects when a recording or a
    /// transition is already in progress.
    ///
    /// # Errors
    ///
    /// Returns error if the microphone cannot be acquired; an error event is
    /// emitted as well and the controller stays idle
    pub async fn start(&self) -> Result<bool> {
        {
            let mut state = self.lock();
            if state.phase != CapturePhase::Idle || self.closed.is_cancelled() {
                tracing::debug!(phase = ?state.phase, "capture start ignored");
                return Ok(false);
            }
            state.phase = CapturePhase::Starting;
        }

        let input = match self.source.open().await {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!(error = %e, "failed to acquire microphone");
                self.lock().phase = CapturePhase::Idle;
                let _ = self.events.send(CaptureEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let mut state = self.lock();
        if self.closed.is_cancelled() {
            state.phase = CapturePhase::Idle;
            drop(state);
            drop(input);
            return Ok(false);
        }

        state.phase = CapturePhase::Recording;
        let _ = self.events.send(CaptureEvent::Recording(true));

        let worker = RecordingWorker {
            events: self.events.clone(),
            accumulated: String::new(),
        };
        let task = tokio::spawn(worker.run(
            input,
            self.backend.clone(),
            cancel.clone(),
            Arc::clone(&self.state),
        ));
        state.active = Some(ActiveRecording { cancel, task });
        drop(state);

        tracing::info!("recording started");
        Ok(true)
    }

    /// End the current recording and wait until it has been flushed
    ///
    /// A no-op when not recording or while a transition is in progress.
    pub async fn stop(&self) {
        let active = {
            let mut state = self.lock();
            if state.phase != CapturePhase::Recording {
                return;
            }
            state.phase = CapturePhase::Stopping;
            state.active.take()
        };

        if let Some(active) = active {
            active.cancel.cancel();
            let _ = active.task.await;
        }
    }

    /// Stop any recording and refuse further starts
    pub async fn shutdown(&self) {
        self.closed.cancel();
        let active = self.lock().active.take();
        if let Some(active) = active {
            active.cancel.cancel();
            let _ = active.task.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SpeechCapture {
    fn drop(&mut self) {
        self.closed.cancel();
        if let Some(active) = self.lock().active.take() {
            active.cancel.cancel();
        }
    }
}

/// Owns one recording from start to the final flush
struct RecordingWorker {
    events: mpsc::UnboundedSender<CaptureEvent>,
    accumulated: String,
}

impl RecordingWorker {
    async fn run(
        mut self,
        input: AudioInput,
        backend: CaptureBackend,
        cancel: CancellationToken,
        state: Arc<Mutex<CaptureState>>,
    ) {
        match backend {
            CaptureBackend::Streaming(transcriber) => {
                self.run_streaming(input, transcriber.as_ref(), &cancel).await;
            }
            CaptureBackend::Batch {
                transcriber,
                max_recording,
            } => {
                self.run_batch(input, transcriber.as_ref(), max_recording, &cancel)
                    .await;
            }
        }

        let text = self.accumulated.trim();
        if !text.is_empty() {
            tracing::info!(transcript = %text, "recording finalized");
            let _ = self.events.send(CaptureEvent::Final(text.to_string()));
        }
        let _ = self.events.send(CaptureEvent::Recording(false));

        state.lock().unwrap_or_else(PoisonError::into_inner).phase = CapturePhase::Idle;
        tracing::debug!("recording ended");
    }

    async fn run_streaming(
        &mut self,
        input: AudioInput,
        transcriber: &dyn StreamingTranscriber,
        cancel: &CancellationToken,
    ) {
        let (tx, rx) = mpsc::channel::<Vec<f32>>(FRAME_BUFFER);
        let mut fragments =
            transcriber.transcribe_stream(Box::pin(ReceiverStream::new(rx)), input.sample_rate());
        let mut input = Some(input);
        let mut tx = Some(tx);

        loop {
            tokio::select! {
                () = cancel.cancelled(), if input.is_some() => {
                    // Release the device and let the transcriber finalize
                    input = None;
                    tx = None;
                }
                frame = next_frame(&mut input) => match frame {
                    Some(Ok(samples)) => {
                        if tx.as_ref().is_some_and(|tx| tx.try_send(samples).is_err()) {
                            tracing::trace!("transcriber lagging, frame dropped");
                        }
                    }
                    Some(Err(e)) => {
                        self.fail(&e);
                        return;
                    }
                    None => {
                        tracing::debug!("audio input ended");
                        input = None;
                        tx = None;
                    }
                },
                fragment = fragments.next() => match fragment {
                    Some(Ok(TranscriptFragment::Interim(text))) => self.preview(&text),
                    Some(Ok(TranscriptFragment::Final(text))) => self.append(&text),
                    Some(Err(e)) => {
                        self.fail(&e);
                        return;
                    }
                    None => return,
                },
            }
        }
    }

    async fn run_batch(
        &mut self,
        mut input: AudioInput,
        transcriber: &dyn Transcriber,
        max_recording: Duration,
        cancel: &CancellationToken,
    ) {
        let mut samples = Vec::new();
        let deadline = tokio::time::sleep(max_recording);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = &mut deadline => {
                    tracing::info!(
                        max_ms = u64::try_from(max_recording.as_millis()).unwrap_or(u64::MAX),
                        "maximum recording duration reached"
                    );
                    break;
                }
                frame = input.next_frame() => match frame {
                    Some(Ok(frame)) => samples.extend_from_slice(&frame),
                    Some(Err(e)) => {
                        self.fail(&e);
                        return;
                    }
                    None => break,
                },
            }
        }

        let sample_rate = input.sample_rate();
        drop(input);

        if samples.is_empty() {
            return;
        }

        let result = match samples_to_wav(&samples, sample_rate) {
            Ok(wav) => transcriber.transcribe(&wav, "audio/wav").await,
            Err(e) => Err(e),
        };
        match result {
            Ok(transcript) => self.append(&transcript.text),
            Err(e) => self.fail(&e),
        }
    }

    fn preview(&self, interim: &str) {
        let preview = format!("{} {}", self.accumulated, interim.trim());
        let _ = self
            .events
            .send(CaptureEvent::Preview(preview.trim().to_string()));
    }

    fn append(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.accumulated.is_empty() {
            self.accumulated.push(' ');
        }
        self.accumulated.push_str(text);
        let _ = self
            .events
            .send(CaptureEvent::Transcript(self.accumulated.clone()));
    }

    fn fail(&self, error: &Error) {
        tracing::warn!(error = %error, "recording failed");
        let _ = self.events.send(CaptureEvent::Error(error.to_string()));
    }
}

/// Next frame from an optional input; pending forever once released
async fn next_frame(input: &mut Option<AudioInput>) -> Option<Result<Vec<f32>>> {
    match input {
        Some(input) => input.next_frame().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_matches_input() {
        let samples = vec![0.0f32, 0.5, -0.5, 1.0];
        let wav = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 4);
    }

    #[test]
    fn input_release_runs_once_on_drop() {
        let released = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (_tx, rx) = mpsc::channel(1);
        let counter = Arc::clone(&released);
        let input = AudioInput::new(rx, SAMPLE_RATE, move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        drop(input);
        assert_eq!(released.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn downmix_averages_channels() {
        assert_eq!(downmix(&[0.25, 0.75, -1.0, 1.0], 2), vec![0.5, 0.0]);
        assert_eq!(downmix(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }

    #[test]
    fn classifies_permission_errors() {
        assert!(matches!(
            classify_device_error("Permission denied by the system"),
            Error::MicrophonePermission(_)
        ));
        assert!(matches!(
            classify_device_error("The requested device is not available"),
            Error::CaptureUnsupported(_)
        ));
        assert!(matches!(
            classify_device_error("buffer underrun"),
            Error::Capture(_)
        ));
    }
}
