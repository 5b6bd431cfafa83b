//! Persona configuration
//!
//! A persona supplies the assistant's name, the seeded greeting, the persona
//! directive sent with every generation call, the closing directive used for the
//! final turn of a demo conversation, and default voice parameters.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default persona id
pub const DEFAULT_PERSONA_ID: &str = "beatriz";

/// Personas compiled into the binary
const EMBEDDED_PERSONAS: &[(&str, &str)] = &[
    ("beatriz", include_str!("../personas/beatriz.json")),
    ("synthia", include_str!("../personas/synthia.json")),
];

/// Identity and behavior of the assistant
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    /// Semantic version of this persona file
    pub version: String,

    /// Core identity
    pub identity: Identity,

    /// Voice defaults
    pub voice: Option<Voice>,

    /// Greeting and directives
    pub personality: Personality,
}

/// Core identity of the persona
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Unique identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// Short descriptive phrase
    pub tagline: Option<String>,
}

/// Voice defaults for synthesis
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Voice {
    /// Synthesis backend voice identity
    pub voice_id: Option<String>,

    /// Target speaking rate (1.0 = normal)
    pub speaking_rate: Option<f32>,
}

/// Conversation behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Personality {
    /// First assistant message of every conversation
    pub greeting: String,

    /// System directive for regular turns
    pub directive: String,

    /// System directive for the final turn of a capped conversation
    pub closing_directive: String,
}

impl Persona {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.identity.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    #[must_use]
    pub fn greeting(&self) -> &str {
        &self.personality.greeting
    }

    #[must_use]
    pub fn directive(&self) -> &str {
        &self.personality.directive
    }

    #[must_use]
    pub fn closing_directive(&self) -> &str {
        &self.personality.closing_directive
    }

    /// Voice id override, if the persona defines one
    #[must_use]
    pub fn voice_id(&self) -> Option<&str> {
        self.voice.as_ref().and_then(|v| v.voice_id.as_deref())
    }

    /// Speaking rate, defaulting to 1.0
    #[must_use]
    pub fn speaking_rate(&self) -> f32 {
        self.voice
            .as_ref()
            .and_then(|v| v.speaking_rate)
            .unwrap_or(1.0)
    }

    /// Load a persona compiled into the binary
    ///
    /// # Errors
    ///
    /// Returns error if no embedded persona has this id
    pub fn embedded(persona_id: &str) -> Result<Self> {
        let (_, json) = EMBEDDED_PERSONAS
            .iter()
            .find(|(id, _)| *id == persona_id)
            .ok_or_else(|| Error::Config(format!("unknown persona: {persona_id}")))?;

        let persona: Self = serde_json::from_str(json)?;
        tracing::debug!(persona_id, "loaded embedded persona");
        Ok(persona)
    }

    /// Load a persona from a JSON or TOML file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let persona: Self = if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        tracing::info!(path = %path.display(), persona = persona.id(), "loaded persona file");
        Ok(persona)
    }

    /// Ids of the embedded personas
    #[must_use]
    pub fn embedded_ids() -> Vec<&'static str> {
        EMBEDDED_PERSONAS.iter().map(|(id, _)| *id).collect()
    }
}
