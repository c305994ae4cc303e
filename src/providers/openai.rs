//! OpenAI Chat Completions client.

use super::{LanguageModel, ProviderError};
use crate::config::LlmConfig;
use crate::session::conversation::Turn;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Clone)]
pub struct OpenAiChat {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Request(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
        })
    }
}

fn build_request<'a>(model: &'a str, turns: &'a [Turn]) -> ChatCompletionRequest<'a> {
    ChatCompletionRequest {
        model,
        messages: turns
            .iter()
            .map(|turn| ChatMessage { role: turn.role.as_str(), content: &turn.text })
            .collect(),
    }
}

/// First choice content, trimmed. A missing choice or content is an empty reply.
fn extract_reply(response: ChatCompletionResponse) -> String {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .unwrap_or_default()
}

#[async_trait]
impl LanguageModel for OpenAiChat {
    async fn complete(&self, model: &str, turns: &[Turn]) -> Result<String, ProviderError> {
        let body = build_request(model, turns);
        debug!("Requesting completion from {} over {} turns", model, turns.len());

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(format!("OpenAI request: {}", e))
                } else {
                    ProviderError::Request(format!("OpenAI request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read OpenAI error body".to_string());
            return Err(ProviderError::Request(format!("OpenAI returned {}: {}", status, text)));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("Failed to parse OpenAI response: {}", e)))?;

        Ok(extract_reply(parsed))
    }
}
