//! Chat-completions advisory client

use super::{Advisor, ChannelError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You are an SRE assistant. Be concise and practical.";
const MAX_TOKENS: u32 = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: String,
}

/// Advisory client for an OpenAI-compatible chat-completions endpoint
pub struct LlmAdvisor {
    url: String,
    api_key: String,
    model: String,
    enabled: bool,
    client: reqwest::Client,
}

impl LlmAdvisor {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>, enabled: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            api_key: api_key.into(),
            model: model.into(),
            enabled,
            client,
        }
    }
}

#[async_trait]
impl Advisor for LlmAdvisor {
    /// Requires the enable flag plus both endpoint and key
    fn enabled(&self) -> bool {
        self.enabled && !self.url.is_empty() && !self.api_key.is_empty()
    }

    async fn diagnose(&self, title: &str, context: &str) -> Result<String, ChannelError> {
        if !self.enabled() {
            return Err(ChannelError::NotConfigured("LLM_API_URL/LLM_API_KEY"));
        }

        let prompt = format!("{title}\n{context}");
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            max_tokens: MAX_TOKENS,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ChannelError::from_response("llm", response).await);
        }

        let body: ChatResponse = response.json().await?;
        Ok(body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default())
    }
}
