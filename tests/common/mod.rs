//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{Semaphore, broadcast, mpsc};
use voicespark::agent::TurnGenerator;
use voicespark::config::{SessionConfig, SimulatedPlaybackConfig, VoiceSettings};
use voicespark::voice::{
    AudioInput, AudioSource, CaptureEvent, FragmentStream, SAMPLE_RATE, SampleStream,
    StreamingTranscriber, Synthesizer, TranscriptFragment,
};
use voicespark::{Error, Message, Result, SessionEvent};

pub const GREETING: &str = "Hello! How can I help you today?";
pub const PERSONA_DIRECTIVE: &str = "You are a caring assistant.";
pub const CLOSING_DIRECTIVE: &str = "Thank the user and say goodbye.";

/// Session configuration with fixed texts
#[must_use]
pub fn session_config(max_user_turns: usize) -> SessionConfig {
    SessionConfig {
        max_user_turns,
        closing_delay: Duration::from_millis(1000),
        greeting: GREETING.to_string(),
        persona_directive: PERSONA_DIRECTIVE.to_string(),
        closing_directive: CLOSING_DIRECTIVE.to_string(),
        auto_submit_transcript: true,
    }
}

/// Simulated playback short enough for real-time tests
#[must_use]
pub const fn quick_playback() -> SimulatedPlaybackConfig {
    SimulatedPlaybackConfig {
        per_char: Duration::from_millis(1),
        min: Duration::from_millis(20),
        max: Duration::from_millis(50),
    }
}

/// One recorded generation call
#[derive(Debug, Clone)]
pub struct GenerationCall {
    pub history: Vec<Message>,
    pub closing_directive: Option<String>,
}

/// Turn generator with scripted replies that records every call
///
/// Unscripted calls answer `reply N`. A gated generator waits for a permit
/// before answering.
#[derive(Default)]
pub struct MockGenerator {
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    calls: Mutex<Vec<GenerationCall>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A generator that answers only once the returned semaphore gets a permit
    #[must_use]
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let generator = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (generator, gate)
    }

    pub fn push_reply(&self, reply: &str) {
        self.replies.lock().unwrap().push_back(Ok(reply.to_string()));
    }

    pub fn push_failure(&self, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    #[must_use]
    pub fn calls(&self) -> Vec<GenerationCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TurnGenerator for MockGenerator {
    async fn generate_turn(
        &self,
        history: &[Message],
        closing_directive: Option<&str>,
    ) -> Result<Message> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(GenerationCall {
                history: history.to_vec(),
                closing_directive: closing_directive.map(ToString::to_string),
            });
            calls.len()
        };

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| Error::Llm(e.to_string()))?
                .forget();
        }

        let scripted = self.replies.lock().unwrap().pop_front();
        match scripted {
            Some(Ok(reply)) => Ok(Message::assistant(reply)),
            Some(Err(message)) => Err(Error::Llm(message)),
            None => Ok(Message::assistant(format!("reply {call_number}"))),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Synthesizer returning the text bytes, or always failing
pub struct MockSynthesizer {
    pub fail: bool,
    pub requests: Mutex<Vec<String>>,
}

impl MockSynthesizer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fail: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn failing() -> Self {
        Self {
            fail: true,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str, _settings: &VoiceSettings) -> Result<Bytes> {
        self.requests.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(Error::Tts("synthesis unavailable".to_string()));
        }
        Ok(Bytes::from(format!("[{text}]")))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Microphone double whose frames are pushed by the test
#[derive(Default)]
pub struct MockMicrophone {
    deny: bool,
    open_delay: Option<Duration>,
    opens: AtomicUsize,
    releases: Arc<AtomicUsize>,
    frames: Mutex<Option<mpsc::Sender<Result<Vec<f32>>>>>,
}

impl MockMicrophone {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A microphone whose access is always refused
    #[must_use]
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// A microphone that takes `delay` to open
    #[must_use]
    pub fn slow(delay: Duration) -> Self {
        Self {
            open_delay: Some(delay),
            ..Self::default()
        }
    }

    /// Deliver a frame to the open input
    pub fn send_frame(&self, samples: Vec<f32>) {
        let frames = self.frames.lock().unwrap();
        let sender = frames.as_ref().expect("microphone not open");
        sender.try_send(Ok(samples)).expect("frame buffer full");
    }

    /// Report a device failure on the open input
    pub fn send_error(&self, message: &str) {
        let frames = self.frames.lock().unwrap();
        let sender = frames.as_ref().expect("microphone not open");
        sender
            .try_send(Err(Error::Capture(message.to_string())))
            .expect("frame buffer full");
    }

    /// Stop delivering frames as if the device went away
    pub fn end_input(&self) {
        self.frames.lock().unwrap().take();
    }

    #[must_use]
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSource for MockMicrophone {
    async fn open(&self) -> Result<AudioInput> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.deny {
            return Err(Error::MicrophonePermission(
                "access to the microphone was refused".to_string(),
            ));
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        *self.frames.lock().unwrap() = Some(tx);

        let releases = Arc::clone(&self.releases);
        Ok(AudioInput::new(rx, SAMPLE_RATE, move || {
            releases.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// Streaming transcriber emitting one scripted fragment per received frame
///
/// Its stream ends when the audio ends.
pub struct ScriptedStreamer {
    script: Vec<TranscriptFragment>,
}

impl ScriptedStreamer {
    #[must_use]
    pub const fn new(script: Vec<TranscriptFragment>) -> Self {
        Self { script }
    }
}

impl StreamingTranscriber for ScriptedStreamer {
    fn transcribe_stream(&self, audio: SampleStream, _sample_rate: u32) -> FragmentStream {
        let script = self.script.clone();
        Box::pin(audio.enumerate().filter_map(move |(index, _)| {
            let fragment = script.get(index).cloned();
            async move { fragment.map(Ok::<_, Error>) }
        }))
    }
}

/// 100ms of constant-amplitude audio at the capture rate
#[must_use]
pub fn frame(amplitude: f32) -> Vec<f32> {
    vec![amplitude; SAMPLE_RATE as usize / 10]
}

/// Wait for the first session event matching `pred`
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

/// Next capture event
pub async fn next_capture_event(events: &mut mpsc::UnboundedReceiver<CaptureEvent>) -> CaptureEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for capture event")
        .expect("capture event channel closed")
}
