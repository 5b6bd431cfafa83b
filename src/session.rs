//! Conversation session
//!
//! A [`Conversation`] owns the message log and the demo-length counter and
//! coordinates turn generation, speech capture and playback. It is the only
//! place where conversation state changes.
//!
//! ```text
//!            submit_user_turn            reply appended
//!   Idle ───────────────────────▶ AwaitingReply ───────────▶ Idle
//!    │                                  │ generation failed    │
//!    │                                  └─────────────────────▶│
//!    │  N-th turn answered (or failed) + closing delay         │
//!    └────────────────────────────────────────────────────▶ Ended
//! ```
//!
//! State lives behind a short-held mutex that is never held across an await.
//! Every reset or shutdown bumps an epoch; a reply or timer that belongs to an
//! older epoch is dropped on arrival.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::agent::TurnGenerator;
use crate::config::{SessionConfig, SimulatedPlaybackConfig};
use crate::message::{Message, Role};
use crate::voice::{
    AudioSource, CaptureBackend, CaptureEvent, PlaybackController, PlaybackEvent, Speaker,
    SpeechCapture,
};
use crate::{Error, Result};

/// Capacity of the session event channel
const EVENT_CAPACITY: usize = 256;

/// Turn lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Ready for the next user turn
    Idle,
    /// A generation call is in flight
    AwaitingReply,
    /// The demo conversation is over
    Ended,
}

/// Why a submission was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Text was empty after trimming
    Blank,
    /// A reply is still pending
    AwaitingReply,
    /// The conversation has ended
    Ended,
    /// The demo cap was reached and the conversation is closing
    LimitReached,
}

/// Result of a submission
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The reply was appended to the log
    Replied(Message),
    /// The submission was ignored; the log is unchanged
    Rejected(RejectReason),
    /// The session was reset while the reply was pending
    Discarded,
}

/// Notification about a session state change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    MessageAppended(Message),
    PhaseChanged(Phase),
    SpeakingChanged(bool),
    ListeningChanged(bool),
    TranscriptPreview(String),
    PendingInputChanged(String),
    /// Recoverable failure to surface to the user
    Notice(String),
    Ended,
    Reset,
}

/// Immutable view of a session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub messages: Vec<Message>,
    pub phase: Phase,
    pub speaking: bool,
    pub listening: bool,
    pub user_turn_count: usize,
    pub max_user_turns: usize,
    pub pending_input: String,
    pub transcript_preview: Option<String>,
    pub capture_available: bool,
}

impl Snapshot {
    /// User messages remaining before the conversation closes
    #[must_use]
    pub const fn turns_remaining(&self) -> usize {
        self.max_user_turns.saturating_sub(self.user_turn_count)
    }
}

struct State {
    messages: Vec<Message>,
    user_turn_count: usize,
    phase: Phase,
    speaking: bool,
    listening: bool,
    pending_input: String,
    preview: Option<String>,
    epoch: u64,
    utterance: Option<u64>,
}

impl State {
    fn seeded(greeting: &str, epoch: u64) -> Self {
        Self {
            messages: vec![Message::assistant(greeting)],
            user_turn_count: 0,
            phase: Phase::Idle,
            speaking: false,
            listening: false,
            pending_input: String::new(),
            preview: None,
            epoch,
            utterance: None,
        }
    }
}

struct Inner {
    config: SessionConfig,
    generator: Arc<dyn TurnGenerator>,
    playback: PlaybackController,
    capture: Option<SpeechCapture>,
    state: Mutex<State>,
    events: broadcast::Sender<SessionEvent>,
}

/// Builder for [`Conversation`]
pub struct ConversationBuilder {
    config: SessionConfig,
    generator: Arc<dyn TurnGenerator>,
    speaker: Option<Arc<Speaker>>,
    capture: Option<(Arc<dyn AudioSource>, CaptureBackend)>,
}

impl ConversationBuilder {
    /// Speech output; defaults to simulated playback
    #[must_use]
    pub fn speaker(mut self, speaker: Arc<Speaker>) -> Self {
        self.speaker = Some(speaker);
        self
    }

    /// Enable speech capture
    #[must_use]
    pub fn capture(mut self, source: Arc<dyn AudioSource>, backend: CaptureBackend) -> Self {
        self.capture = Some((source, backend));
        self
    }

    /// Build the session and start its event pumps
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn build(self) -> Conversation {
        let speaker = self
            .speaker
            .unwrap_or_else(|| Arc::new(Speaker::simulated(SimulatedPlaybackConfig::default())));
        let (playback, playback_events) = PlaybackController::new(speaker);
        let (capture, capture_events) = match self.capture {
            Some((source, backend)) => {
                let (capture, rx) = SpeechCapture::new(source, backend);
                (Some(capture), Some(rx))
            }
            None => (None, None),
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            state: Mutex::new(State::seeded(&self.config.greeting, 0)),
            config: self.config,
            generator: self.generator,
            playback,
            capture,
            events,
        });

        tokio::spawn(pump_playback(Arc::downgrade(&inner), playback_events));
        if let Some(rx) = capture_events {
            tokio::spawn(pump_capture(Arc::downgrade(&inner), rx));
        }

        tracing::debug!(
            generator = inner.generator.name(),
            max_user_turns = inner.config.max_user_turns,
            capture = inner.capture.is_some(),
            "conversation created"
        );

        Conversation { inner }
    }
}

/// A bounded-length voice conversation
pub struct Conversation {
    inner: Arc<Inner>,
}

impl Conversation {
    /// Start building a conversation
    #[must_use]
    pub fn builder(config: SessionConfig, generator: Arc<dyn TurnGenerator>) -> ConversationBuilder {
        ConversationBuilder {
            config,
            generator,
            speaker: None,
            capture: None,
        }
    }

    /// Current state
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let state = self.inner.lock();
        Snapshot {
            messages: state.messages.clone(),
            phase: state.phase,
            speaking: state.speaking,
            listening: state.listening,
            user_turn_count: state.user_turn_count,
            max_user_turns: self.inner.config.max_user_turns,
            pending_input: state.pending_input.clone(),
            transcript_preview: state.preview.clone(),
            capture_available: self.inner.capture.is_some(),
        }
    }

    /// Receive session events from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Submit a user message and wait for the reply
    ///
    /// Blank text, a pending reply, an ended conversation or a reached cap
    /// yield [`TurnOutcome::Rejected`] without touching the log.
    ///
    /// # Errors
    ///
    /// Returns error if turn generation fails; the user message stays in the
    /// log and the session is idle again
    pub async fn submit_user_turn(&self, text: &str) -> Result<TurnOutcome> {
        self.inner.submit_user_turn(text).await
    }

    /// Replace the pending input echo
    pub fn set_pending_input(&self, text: &str) {
        self.inner.set_pending_input(text);
    }

    /// Submit the pending input echo
    ///
    /// # Errors
    ///
    /// Returns error if turn generation fails
    pub async fn submit_pending_input(&self) -> Result<TurnOutcome> {
        self.inner.submit_pending_input().await
    }

    /// Speak `text`, superseding any current utterance
    pub fn speak(&self, text: &str) {
        self.inner.speak(text);
    }

    /// Start recording speech
    ///
    /// Returns `Ok(false)` when a recording is already active or the
    /// conversation has ended.
    ///
    /// # Errors
    ///
    /// Returns `CaptureUnsupported` without a capture source, or the error
    /// from acquiring the microphone
    pub async fn request_speech_capture(&self) -> Result<bool> {
        let capture = self
            .inner
            .capture
            .as_ref()
            .ok_or_else(|| Error::CaptureUnsupported("no capture source configured".to_string()))?;

        if self.inner.lock().phase == Phase::Ended {
            return Ok(false);
        }
        capture.start().await
    }

    /// Stop recording; the transcript, if any, is delivered
    pub async fn cancel_speech_capture(&self) {
        if let Some(capture) = &self.inner.capture {
            capture.stop().await;
        }
    }

    /// Discard the conversation and start over from the greeting
    pub async fn reset(&self) {
        if let Some(capture) = &self.inner.capture {
            capture.stop().await;
        }
        self.inner.playback.cancel();

        let greeting = {
            let mut state = self.inner.lock();
            let epoch = state.epoch + 1;
            *state = State::seeded(&self.inner.config.greeting, epoch);
            state.messages[0].clone()
        };

        tracing::info!("conversation reset");
        self.inner.emit(SessionEvent::Reset);
        self.inner.emit(SessionEvent::MessageAppended(greeting));
    }

    /// Release the microphone and output and drop pending work
    pub async fn shutdown(&self) {
        if let Some(capture) = &self.inner.capture {
            capture.shutdown().await;
        }
        self.inner.playback.cancel();

        let mut state = self.inner.lock();
        state.epoch += 1;
        state.speaking = false;
        state.listening = false;
        state.utterance = None;
        drop(state);
        tracing::debug!("conversation shut down");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn submit_user_turn(self: &Arc<Self>, text: &str) -> Result<TurnOutcome> {
        let text = text.trim();
        let max_turns = self.config.max_user_turns;

        let (history, closing, epoch, user_message, cleared_input) = {
            let mut state = self.lock();
            let rejected = if text.is_empty() {
                Some(RejectReason::Blank)
            } else {
                match state.phase {
                    Phase::AwaitingReply => Some(RejectReason::AwaitingReply),
                    Phase::Ended => Some(RejectReason::Ended),
                    Phase::Idle if state.user_turn_count >= max_turns => {
                        Some(RejectReason::LimitReached)
                    }
                    Phase::Idle => None,
                }
            };
            if let Some(reason) = rejected {
                tracing::debug!(?reason, "submission rejected");
                return Ok(TurnOutcome::Rejected(reason));
            }

            let message = Message::user(text);
            state.messages.push(message.clone());
            state.user_turn_count += 1;
            state.phase = Phase::AwaitingReply;
            let cleared_input = !state.pending_input.is_empty();
            state.pending_input.clear();

            let closing = (state.user_turn_count == max_turns)
                .then(|| self.config.closing_directive.clone());
            (
                state.messages.clone(),
                closing,
                state.epoch,
                message,
                cleared_input,
            )
        };

        tracing::info!(
            turn = history.iter().filter(|m| m.role() == Role::User).count(),
            max_turns,
            closing = closing.is_some(),
            "user turn accepted"
        );
        self.emit(SessionEvent::MessageAppended(user_message));
        if cleared_input {
            self.emit(SessionEvent::PendingInputChanged(String::new()));
        }
        self.emit(SessionEvent::PhaseChanged(Phase::AwaitingReply));

        let result = self
            .generator
            .generate_turn(&history, closing.as_deref())
            .await;

        let mut state = self.lock();
        if state.epoch != epoch {
            tracing::debug!("reply arrived after reset, discarded");
            return Ok(TurnOutcome::Discarded);
        }

        match result {
            Ok(reply) => {
                let reply = if reply.role() == Role::Assistant {
                    reply
                } else {
                    Message::assistant(reply.content())
                };
                state.messages.push(reply.clone());
                state.phase = Phase::Idle;
                drop(state);

                self.emit(SessionEvent::MessageAppended(reply.clone()));
                self.emit(SessionEvent::PhaseChanged(Phase::Idle));

                if closing.is_some() {
                    self.schedule_end(epoch);
                }
                self.speak(reply.content());
                Ok(TurnOutcome::Replied(reply))
            }
            Err(e) => {
                state.phase = Phase::Idle;
                let cleared_input = !state.pending_input.is_empty();
                state.pending_input.clear();
                drop(state);

                tracing::warn!(generator = self.generator.name(), error = %e, "turn generation failed");
                if cleared_input {
                    self.emit(SessionEvent::PendingInputChanged(String::new()));
                }
                self.emit(SessionEvent::PhaseChanged(Phase::Idle));
                if closing.is_some() {
                    // The final turn was accepted, so the conversation still closes
                    self.emit(SessionEvent::Notice(
                        "Sorry, I couldn't come up with a reply. Thank you for chatting today."
                            .to_string(),
                    ));
                    self.schedule_end(epoch);
                } else {
                    self.emit(SessionEvent::Notice(
                        "Sorry, I couldn't come up with a reply. Please try again.".to_string(),
                    ));
                }
                Err(e)
            }
        }
    }

    /// Move to `Ended` after the closing delay unless the epoch changed
    fn schedule_end(self: &Arc<Self>, epoch: u64) {
        let weak = Arc::downgrade(self);
        let delay = self.config.closing_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };

            let mut state = inner.lock();
            if state.epoch != epoch || state.phase != Phase::Idle {
                return;
            }
            state.phase = Phase::Ended;
            drop(state);

            tracing::info!("demo conversation ended");
            inner.emit(SessionEvent::PhaseChanged(Phase::Ended));
            inner.emit(SessionEvent::Ended);
        });
    }

    fn set_pending_input(&self, text: &str) {
        let mut state = self.lock();
        if state.pending_input == text {
            return;
        }
        state.pending_input = text.to_string();
        drop(state);
        self.emit(SessionEvent::PendingInputChanged(text.to_string()));
    }

    async fn submit_pending_input(self: &Arc<Self>) -> Result<TurnOutcome> {
        let pending = self.lock().pending_input.clone();
        self.submit_user_turn(&pending).await
    }

    fn speak(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }

        let mut state = self.lock();
        // Holding the lock orders this ahead of the utterance's completion event
        let utterance = self.playback.play(text.to_string());
        state.utterance = Some(utterance);
        let changed = !state.speaking;
        state.speaking = true;
        drop(state);

        if changed {
            self.emit(SessionEvent::SpeakingChanged(true));
        }
    }

    fn on_playback_event(&self, event: &PlaybackEvent) {
        if let PlaybackEvent::Failed { message, .. } = event {
            tracing::debug!(error = %message, "speech playback failed");
        }
        if matches!(event, PlaybackEvent::Started { .. }) {
            return;
        }

        let mut state = self.lock();
        if state.utterance != Some(event.utterance()) {
            return;
        }
        state.utterance = None;
        let changed = state.speaking;
        state.speaking = false;
        drop(state);

        if changed {
            self.emit(SessionEvent::SpeakingChanged(false));
        }
    }

    fn on_capture_event(self: &Arc<Self>, event: CaptureEvent) {
        match event {
            CaptureEvent::Recording(listening) => {
                let mut state = self.lock();
                let changed = state.listening != listening;
                state.listening = listening;
                if !listening {
                    state.preview = None;
                }
                drop(state);
                if changed {
                    self.emit(SessionEvent::ListeningChanged(listening));
                }
            }
            CaptureEvent::Preview(text) | CaptureEvent::Transcript(text) => {
                self.lock().preview = Some(text.clone());
                self.emit(SessionEvent::TranscriptPreview(text));
            }
            CaptureEvent::Final(text) => {
                if text.trim().is_empty() {
                    return;
                }
                self.set_pending_input(&text);
                if self.config.auto_submit_transcript {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = inner.submit_pending_input().await {
                            tracing::debug!(error = %e, "transcript submission failed");
                        }
                    });
                }
            }
            CaptureEvent::Error(message) => {
                self.emit(SessionEvent::Notice(format!(
                    "Speech capture failed: {message}"
                )));
            }
        }
    }
}

async fn pump_playback(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<PlaybackEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.on_playback_event(&event);
    }
}

async fn pump_capture(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<CaptureEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.on_capture_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_tagged() {
        let value = serde_json::to_value(SessionEvent::SpeakingChanged(true)).unwrap();
        assert_eq!(value["type"], "speaking_changed");
        assert_eq!(value["data"], true);

        let value = serde_json::to_value(SessionEvent::Ended).unwrap();
        assert_eq!(value["type"], "ended");
    }

    #[test]
    fn phase_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(Phase::AwaitingReply).unwrap(),
            "awaiting_reply"
        );
    }

    #[test]
    fn seeded_state_has_only_greeting() {
        let state = State::seeded("Hello!", 3);
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].role(), Role::Assistant);
        assert_eq!(state.user_turn_count, 0);
        assert_eq!(state.epoch, 3);
    }
}
