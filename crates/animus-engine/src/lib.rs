//! The external text-generation collaborator behind one capability trait.
//! The rest of the system never knows whether personas come from a hosted
//! LLM API or the deterministic template backend used in tests and
//! keyless dev setups.

pub mod deepseek;
pub mod template;

use async_trait::async_trait;
use thiserror::Error;

use animus_types::api::GenerateRequest;
use animus_types::models::{ChatMessage, Persona};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("generation request failed: {0}")]
    Request(String),

    #[error("generation backend returned an unusable response: {0}")]
    BadResponse(String),
}

/// What the collaborator hands back for a new persona. Ids, timestamps,
/// ownership, and generation parameters are assigned by the registry.
#[derive(Debug, Clone)]
pub struct GeneratedPersona {
    pub name: String,
    pub prompt: String,
    pub rules: Vec<String>,
    pub personality: String,
}

#[async_trait]
pub trait PersonaEngine: Send + Sync {
    /// Turn a free-text description (plus optional hints) into a persona
    /// definition.
    async fn generate(&self, request: &GenerateRequest) -> Result<GeneratedPersona, EngineError>;

    /// Produce the persona's reply to `message`, given the recent
    /// conversation as context.
    async fn respond(
        &self,
        persona: &Persona,
        message: &str,
        context: &[ChatMessage],
    ) -> Result<String, EngineError>;
}

/// Flatten a persona definition into the single system message both backends
/// feed their models.
pub fn system_prompt(persona: &Persona) -> String {
    let mut out = persona.prompt.clone();
    if !persona.personality.is_empty() {
        out.push_str("\n\nPersonality: ");
        out.push_str(&persona.personality);
    }
    if !persona.rules.is_empty() {
        out.push_str("\n\nRules you must follow:");
        for rule in &persona.rules {
            out.push_str("\n- ");
            out.push_str(rule);
        }
    }
    out
}
