//! Persona backend on top of a DeepSeek-style chat-completions API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use animus_types::api::GenerateRequest;
use animus_types::models::{ChatMessage, Persona};

use crate::{EngineError, GeneratedPersona, PersonaEngine, system_prompt};

pub const DEFAULT_API_URL: &str = "https://api.deepseek.com/v1/chat/completions";
const MODEL: &str = "deepseek-chat";

pub struct DeepSeekEngine {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Shape we ask the model to emit when generating a persona.
#[derive(Debug, Deserialize)]
struct GeneratedJson {
    name: String,
    prompt: String,
    #[serde(default)]
    rules: Vec<String>,
    #[serde(default)]
    personality: String,
}

impl DeepSeekEngine {
    pub fn new(api_key: String, api_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_key,
        }
    }

    async fn complete(&self, request: CompletionRequest<'_>) -> Result<String, EngineError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(EngineError::Request(format!(
                "upstream returned {status}: {snippet}"
            )));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| EngineError::BadResponse(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| EngineError::BadResponse("no choices in completion".into()))
    }
}

#[async_trait]
impl PersonaEngine for DeepSeekEngine {
    async fn generate(&self, request: &GenerateRequest) -> Result<GeneratedPersona, EngineError> {
        let mut instruction = format!(
            "Design a chatbot persona based on this description: {}\n",
            request.description
        );
        if let Some(personality) = request.personality.as_deref() {
            instruction.push_str(&format!("Desired personality: {personality}\n"));
        }
        if let Some(domain) = request.domain.as_deref() {
            instruction.push_str(&format!("Domain of expertise: {domain}\n"));
        }
        if let Some(extra) = request.special_instructions.as_deref() {
            instruction.push_str(&format!("Special instructions: {extra}\n"));
        }
        instruction.push_str(
            "Respond with only a JSON object: {\"name\": string, \"prompt\": string, \
             \"rules\": [string], \"personality\": string}. The prompt is the persona's \
             full system prompt.",
        );

        let content = self
            .complete(CompletionRequest {
                model: MODEL,
                messages: vec![WireMessage {
                    role: "user",
                    content: instruction,
                }],
                temperature: 0.7,
                max_tokens: 1000,
            })
            .await?;

        let parsed: GeneratedJson = serde_json::from_str(strip_code_fence(&content))
            .map_err(|e| EngineError::BadResponse(format!("invalid persona JSON: {e}")))?;

        debug!("Generated persona '{}' via DeepSeek", parsed.name);
        Ok(GeneratedPersona {
            name: parsed.name,
            prompt: parsed.prompt,
            rules: parsed.rules,
            personality: parsed.personality,
        })
    }

    async fn respond(
        &self,
        persona: &Persona,
        message: &str,
        context: &[ChatMessage],
    ) -> Result<String, EngineError> {
        let mut messages = vec![WireMessage {
            role: "system",
            content: system_prompt(persona),
        }];
        for turn in context {
            messages.push(WireMessage {
                role: turn.role.as_str(),
                content: turn.content.clone(),
            });
        }
        messages.push(WireMessage {
            role: "user",
            content: message.to_string(),
        });

        self.complete(CompletionRequest {
            model: MODEL,
            messages,
            temperature: persona.temperature,
            max_tokens: persona.max_tokens,
        })
        .await
    }
}

/// Models love wrapping JSON in markdown fences; peel them off before parsing.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }
}
