//! Credential-free keyword responder
//!
//! Matches keywords in the latest user message against a fixed topic table and
//! answers with a canned response. Deterministic and latency free.

use async_trait::async_trait;

use super::{TurnGenerator, last_user_message};
use crate::message::Message;
use crate::Result;

/// A canned answer keyed by topic
#[derive(Debug, Clone, Copy)]
pub struct Topic {
    /// Topic key
    pub key: &'static str,
    /// Lowercase substrings that select this topic
    pub keywords: &'static [&'static str],
    /// Canned answer
    pub response: &'static str,
}

/// Topic table, checked in order
pub const TOPICS: &[Topic] = &[
    Topic {
        key: "sundowning",
        keywords: &["sundown"],
        response: "Sundowning can be challenging, so try keeping a consistent daily routine, \
                   adding light before sunset, and lowering noise in the evening. \
                   What time of day does it usually start for your loved one?",
    },
    Topic {
        key: "medication management",
        keywords: &["medication", "medicine", "pill"],
        response: "A weekly pill organizer, a fixed schedule and simple reminders make \
                   medications much easier to manage. Would you like tips on tracking side effects?",
    },
    Topic {
        key: "communication",
        keywords: &["communicat", "talk", "conversation"],
        response: "Speaking slowly with short, simple sentences and gentle eye contact \
                   usually helps a lot. What makes conversations hardest for you right now?",
    },
    Topic {
        key: "activities",
        keywords: &["activit", "engage", "hobby"],
        response: "Music, looking at family photos, gardening or baking together are \
                   wonderful ways to connect with past interests. What did your loved one enjoy doing before?",
    },
    Topic {
        key: "caregiver stress",
        keywords: &["tired", "stress", "overwhelm", "exhaust", "myself"],
        response: "Caring for yourself matters just as much, so please take regular breaks \
                   and lean on family, friends or a support group. Do you have someone who can give you a few hours off?",
    },
];

/// Answer when no topic matches
pub const DEFAULT_RESPONSE: &str = "I understand caring for someone with dementia can be \
    challenging. Could you tell me a little more about your specific concern?";

/// Answer when the history has no user message yet
pub const GREETING_RESPONSE: &str = "Hello! How can I help you with dementia care today?";

/// Answer when a closing directive is supplied
pub const GOODBYE_RESPONSE: &str = "Thank you so much for talking with me today, it was \
    truly a pleasure. Please take good care of yourself, and goodbye for now.";

/// Local drop-in replacement for a language model backend
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordResponder;

impl KeywordResponder {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Topic matching `input`, if any
    #[must_use]
    pub fn topic_for(input: &str) -> Option<&'static Topic> {
        let lower = input.to_lowercase();
        TOPICS
            .iter()
            .find(|topic| topic.keywords.iter().any(|k| lower.contains(k)))
    }

    /// Canned answer for a history
    #[must_use]
    pub fn respond(history: &[Message], closing_directive: Option<&str>) -> &'static str {
        if closing_directive.is_some() {
            return GOODBYE_RESPONSE;
        }

        last_user_message(history).map_or(GREETING_RESPONSE, |m| {
            Self::topic_for(m.content()).map_or(DEFAULT_RESPONSE, |t| t.response)
        })
    }
}

#[async_trait]
impl TurnGenerator for KeywordResponder {
    async fn generate_turn(
        &self,
        history: &[Message],
        closing_directive: Option<&str>,
    ) -> Result<Message> {
        let response = Self::respond(history, closing_directive);
        tracing::debug!(response_len = response.len(), "keyword responder answered");
        Ok(Message::assistant(response))
    }

    fn name(&self) -> &'static str {
        "keyword-responder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    #[test]
    fn matches_sundowning_topic() {
        let topic = KeywordResponder::topic_for("How can I help with sundowning?").unwrap();
        assert_eq!(topic.key, "sundowning");
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let topic = KeywordResponder::topic_for("I'm so TIRED lately").unwrap();
        assert_eq!(topic.key, "caregiver stress");
    }

    #[test]
    fn unmatched_input_gets_default() {
        let history = [Message::user("What's the weather like?")];
        assert_eq!(KeywordResponder::respond(&history, None), DEFAULT_RESPONSE);
    }

    #[test]
    fn greets_without_user_message() {
        let history = [Message::assistant("Hello!")];
        assert_eq!(KeywordResponder::respond(&history, None), GREETING_RESPONSE);
    }

    #[test]
    fn uses_latest_user_message_only() {
        let history = [
            Message::user("tell me about sundowning"),
            Message::assistant("..."),
            Message::user("what about medication?"),
        ];
        let topic_response = KeywordResponder::respond(&history, None);
        assert!(topic_response.contains("pill organizer"));
    }

    #[test]
    fn closing_directive_says_goodbye() {
        let history = [Message::user("sundowning again")];
        assert_eq!(
            KeywordResponder::respond(&history, Some("say goodbye")),
            GOODBYE_RESPONSE
        );
    }

    #[tokio::test]
    async fn generates_assistant_message() {
        let history = [Message::user("How can I help with sundowning?")];
        let message = KeywordResponder::new()
            .generate_turn(&history, None)
            .await
            .unwrap();

        assert_eq!(message.role(), Role::Assistant);
        assert_eq!(message.content(), TOPICS[0].response);
    }
}
