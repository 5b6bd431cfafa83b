//! VoiceSpark - voice conversation core for a caregiver assistant demo
//!
//! This library provides:
//! - A bounded-length conversation session with a fixed turn cap
//! - Turn generation via a chat-completions backend or a keyword fallback
//! - Speech capture with live transcripts, and speech playback
//! - An HTTP API exposing sessions and the voice adapters
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Interfaces                       │
//! │        Terminal chat  │  HTTP API  │  SSE           │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Conversation                       │
//! │   Message log  │  Turn cap  │  Capture  │  Playback │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Adapters                          │
//! │   Chat completions  │  Deepgram/Whisper  │  TTS     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod message;
pub mod persona;
pub mod session;
pub mod voice;

pub use agent::{ChatCompletionsGenerator, KeywordResponder, TurnGenerator};
pub use api::{ApiServer, ApiState};
pub use config::{Config, SessionConfig};
pub use error::{Error, Result};
pub use message::{Message, Role};
pub use persona::Persona;
pub use session::{
    Conversation, ConversationBuilder, Phase, RejectReason, SessionEvent, Snapshot, TurnOutcome,
};
