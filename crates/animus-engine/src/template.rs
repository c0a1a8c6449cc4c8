//! Deterministic, offline persona backend. Selects one of a few archetypes
//! by keyword and echoes conversational replies without any network call.
//! This is the engine the tests inject and the default when no API key is
//! configured.

use async_trait::async_trait;

use animus_types::api::GenerateRequest;
use animus_types::models::{ChatMessage, Persona, Role};

use crate::{EngineError, GeneratedPersona, PersonaEngine};

struct Archetype {
    name: &'static str,
    prompt: &'static str,
    personality: &'static str,
    rules: &'static [&'static str],
    keywords: &'static [&'static str],
}

const ARCHETYPES: &[Archetype] = &[
    Archetype {
        name: "Sophia the Wise",
        prompt: "You are Sophia, a wise and thoughtful mentor. You provide deep insights, \
                 ask thought-provoking questions, and help users explore complex topics \
                 with nuance.",
        personality: "Wise, thoughtful, philosophical",
        rules: &[
            "Answer with depth rather than speed",
            "Ask a clarifying question when the topic is broad",
        ],
        keywords: &["wise", "mentor", "philosophy", "teacher", "tutor"],
    },
    Archetype {
        name: "Maya the Creative",
        prompt: "You are Maya, an imaginative artist and creative collaborator. You are \
                 full of innovative ideas and help users tap into their creative potential.",
        personality: "Creative, imaginative, inspiring",
        rules: &[
            "Offer at least one unconventional idea per reply",
            "Encourage experimentation",
        ],
        keywords: &["creative", "art", "design", "music", "write"],
    },
    Archetype {
        name: "Alex the Helper",
        prompt: "You are Alex, a warm and helpful assistant. You are patient, encouraging, \
                 and always ready to help users with their questions and tasks.",
        personality: "Friendly, patient, encouraging",
        rules: &["Keep answers practical", "Stay positive"],
        keywords: &[],
    },
];

pub struct TemplateEngine;

impl TemplateEngine {
    fn pick(description: &str) -> &'static Archetype {
        let lower = description.to_lowercase();
        ARCHETYPES
            .iter()
            .find(|a| a.keywords.iter().any(|k| lower.contains(k)))
            // The last archetype has no keywords and always matches.
            .unwrap_or(&ARCHETYPES[ARCHETYPES.len() - 1])
    }
}

#[async_trait]
impl PersonaEngine for TemplateEngine {
    async fn generate(&self, request: &GenerateRequest) -> Result<GeneratedPersona, EngineError> {
        let archetype = Self::pick(&request.description);

        let mut prompt = archetype.prompt.to_string();
        if let Some(domain) = request.domain.as_deref().filter(|d| !d.is_empty()) {
            prompt.push_str(&format!(" Your area of focus is {domain}."));
        }
        if let Some(extra) = request
            .special_instructions
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            prompt.push_str(&format!(" Additional instructions: {extra}"));
        }

        let personality = request
            .personality
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| archetype.personality.to_string());

        Ok(GeneratedPersona {
            name: archetype.name.to_string(),
            prompt,
            rules: archetype.rules.iter().map(|r| r.to_string()).collect(),
            personality,
        })
    }

    async fn respond(
        &self,
        persona: &Persona,
        message: &str,
        context: &[ChatMessage],
    ) -> Result<String, EngineError> {
        // The context holds only the turns before `message`.
        let prior_turns = context.iter().filter(|m| m.role == Role::User).count();
        let reply = if prior_turns == 0 {
            format!(
                "Hello! I'm {}. You said: \"{}\". Tell me more and I'll do my best to help.",
                persona.name, message
            )
        } else {
            format!(
                "{} here. Thinking about \"{}\" in light of our conversation so far, \
                 here's my take: let's break it down together.",
                persona.name, message
            )
        };
        Ok(reply)
    }
}
