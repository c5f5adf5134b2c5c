//! ============================================================================
//! Summarizer - Chat completion capability used for memory decisions
//! ============================================================================
//! Prompt in, free text out. Callers that expect JSON go through
//! `parse_json_object`, which never fails hard.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// x.ai chat completions endpoint
const XAI_CHAT_URL: &str = "https://api.x.ai/v1/chat/completions";
const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Summarization / classification capability
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Run one completion with a system instruction and a user prompt
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Parse a JSON object out of model output.
///
/// Tries the whole text first, then the slice between the first `{` and
/// the last `}`. Anything else is `None`.
pub fn parse_json_object<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&trimmed[start..=end]) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Discarding unparsable model output: {}", e);
            None
        }
    }
}

/// OpenAI-compatible chat completion client
pub struct ChatSummarizer {
    client: Client,
    api_key: String,
    url: String,
    model: String,
}

impl ChatSummarizer {
    pub fn new_xai(api_key: String, model: String) -> Self {
        Self::new_custom(api_key, XAI_CHAT_URL.to_string(), model)
    }

    pub fn new_openai(api_key: String, model: String) -> Self {
        Self::new_custom(api_key, OPENAI_CHAT_URL.to_string(), model)
    }

    pub fn new_custom(api_key: String, url: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            url,
            model,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Summarizer for ChatSummarizer {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        debug!("Calling chat API with {} chars", prompt.len());

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: Some(0.2),
            max_tokens: Some(512),
        };

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to call chat API: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Chat API error {}: {}", status, body));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse chat response: {}", e))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("No response from chat API"))
    }
}

/// Create a summarizer, trying x.ai first, then OpenAI
pub fn create_summarizer(
    xai_api_key: Option<String>,
    openai_api_key: Option<String>,
    model: &str,
) -> Result<ChatSummarizer> {
    if let Some(key) = xai_api_key.filter(|k| !k.is_empty()) {
        return Ok(ChatSummarizer::new_xai(key, model.to_string()));
    }
    if let Some(key) = openai_api_key.filter(|k| !k.is_empty()) {
        // x.ai model names mean nothing to OpenAI
        return Ok(ChatSummarizer::new_openai(key, "gpt-4o-mini".to_string()));
    }
    Err(anyhow!("No chat API key available (tried x.ai and OpenAI)"))
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_parse_strict_json() {
        let value: Value = parse_json_object(r#"{"store": true}"#).unwrap();
        assert_eq!(value["store"], true);
    }

    #[test]
    fn test_parse_embedded_json() {
        let raw = "Sure! Here is the result:\n```json\n{\"same\": false}\n```\nHope that helps.";
        let value: Value = parse_json_object(raw).unwrap();
        assert_eq!(value["same"], false);
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(parse_json_object::<Value>("no json here").is_none());
        assert!(parse_json_object::<Value>("} backwards {").is_none());
        assert!(parse_json_object::<Value>("{ broken").is_none());
    }

    #[test]
    fn test_summarizer_selection() {
        let s = create_summarizer(Some("xai".to_string()), None, "grok-3-mini").unwrap();
        assert_eq!(s.model(), "grok-3-mini");
        let s = create_summarizer(None, Some("sk".to_string()), "grok-3-mini").unwrap();
        assert_eq!(s.model(), "gpt-4o-mini");
        assert!(create_summarizer(None, None, "grok-3-mini").is_err());
    }
}
