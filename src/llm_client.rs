use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::memory::Turn;

/// Sampling settings, fixed for the process lifetime.
const TEMPERATURE: f32 = 0.7;
const MAX_TOKENS: u32 = 1024;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Completion provider seam. Production uses [`LlmClient`]; tests swap in
/// a scripted backend.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Produce the assistant's next message for the given transcript.
    async fn complete(&self, turns: &[Turn]) -> Result<String>;
}

/// Client for an OpenAI-compatible chat-completions endpoint (Groq by
/// default).
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, model: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build completion HTTP client")?;

        Ok(Self {
            api_url,
            api_key,
            model,
            client,
        })
    }
}

#[async_trait]
impl CompletionBackend for LlmClient {
    async fn complete(&self, turns: &[Turn]) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: turns,
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .context("Failed to send completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Completion API error: {} - {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse completion response")?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .context("Completion response contained no choices")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_in_wire_format() {
        let turns = vec![Turn::system("persona"), Turn::user("Alice: hi")];
        let request = ChatCompletionRequest {
            model: "llama-3.3-70b-versatile",
            messages: &turns,
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "llama-3.3-70b-versatile");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][1]["content"], "Alice: hi");
        assert_eq!(json["max_tokens"], 1024);
    }

    #[test]
    fn response_parses_first_choice() {
        let body = r#"{
            "choices": [
                {"message": {"role": "assistant", "content": "hello there"}}
            ]
        }"#;

        let parsed: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices[0].message.content, "hello there");
    }
}
