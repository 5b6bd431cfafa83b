//! Chat-completions backend (`OpenAI` compatible)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{TurnGenerator, WireMessage, wire_messages};
use crate::config::LlmConfig;
use crate::message::Message;
use crate::{Error, Result};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Generates turns through a chat-completions endpoint
pub struct ChatCompletionsGenerator {
    client: reqwest::Client,
    api_key: String,
    config: LlmConfig,
    persona_directive: String,
}

impl ChatCompletionsGenerator {
    #[must_use]
    pub fn new(api_key: String, config: LlmConfig, persona_directive: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            config,
            persona_directive,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl TurnGenerator for ChatCompletionsGenerator {
    async fn generate_turn(
        &self,
        history: &[Message],
        closing_directive: Option<&str>,
    ) -> Result<Message> {
        let directive = closing_directive.unwrap_or(&self.persona_directive);
        let request = ChatRequest {
            model: &self.config.model,
            messages: wire_messages(directive, history),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            top_p: self.config.top_p,
            frequency_penalty: self.config.frequency_penalty,
            presence_penalty: self.config.presence_penalty,
        };

        tracing::debug!(
            model = %self.config.model,
            messages = request.messages.len(),
            closing = closing_directive.is_some(),
            "requesting chat completion"
        );

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "chat completion request failed");
                Error::Llm(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map_or(body, |b| b.error.message);
            tracing::error!(status = %status, message = %message, "chat completion API error");
            return Err(Error::Llm(format!("chat completion error {status}: {message}")));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Llm(format!("failed to parse chat completion: {e}")))?;

        let content = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::Llm("chat completion returned no content".to_string()))?;

        tracing::debug!(response_len = content.len(), "chat completion received");
        Ok(Message::assistant(content.trim()))
    }

    fn name(&self) -> &'static str {
        "chat-completions"
    }
}
