//! Turn generation
//!
//! A [`TurnGenerator`] receives the full conversation history and returns one
//! assistant message. Exactly one system directive accompanies every call:
//! the persona directive, or a closing directive in its place.

mod chat;
mod fallback;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;

pub use chat::ChatCompletionsGenerator;
pub use fallback::{KeywordResponder, TOPICS, Topic};

use crate::message::{Message, Role};
use crate::{Config, Result};

/// Produces one assistant turn from the conversation so far
#[async_trait]
pub trait TurnGenerator: Send + Sync {
    /// Generate the next assistant message
    ///
    /// When `closing_directive` is supplied it replaces the persona directive.
    ///
    /// # Errors
    ///
    /// Returns error if the backend call fails
    async fn generate_turn(
        &self,
        history: &[Message],
        closing_directive: Option<&str>,
    ) -> Result<Message>;

    /// Generator name for logging
    fn name(&self) -> &'static str;
}

/// One `{role, content}` entry of a chat-completions payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: String,
}

/// Build the wire payload for a generation call
///
/// System entries from the log are dropped and `directive` is prepended as
/// the only system message. Relative order of the remaining entries is kept.
#[must_use]
pub fn wire_messages(directive: &str, history: &[Message]) -> Vec<WireMessage> {
    std::iter::once(WireMessage {
        role: Role::System.as_str(),
        content: directive.to_string(),
    })
    .chain(
        history
            .iter()
            .filter(|m| m.role() != Role::System)
            .map(|m| WireMessage {
                role: m.role().as_str(),
                content: m.content().to_string(),
            }),
    )
    .collect()
}

/// Latest user message in the history, if any
#[must_use]
pub fn last_user_message(history: &[Message]) -> Option<&Message> {
    history.iter().rev().find(|m| m.role() == Role::User)
}

/// Build the generator selected by the configuration
///
/// Without an `OpenAI` key the local keyword responder is used.
#[must_use]
pub fn from_config(config: &Config) -> Arc<dyn TurnGenerator> {
    match &config.api_keys.openai {
        Some(key) => {
            tracing::info!(model = %config.llm.model, "using chat completions backend");
            Arc::new(ChatCompletionsGenerator::new(
                key.expose_secret().to_string(),
                config.llm.clone(),
                config.session.persona_directive.clone(),
            ))
        }
        None => {
            tracing::info!("no language model credential, using keyword responder");
            Arc::new(KeywordResponder::new())
        }
    }
}
