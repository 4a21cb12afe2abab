//! OpenAI-compatible streaming transport
//!
//! Works with any API that implements the OpenAI chat completions format
//! with `stream: true`: Perplexity (the default), OpenAI, Groq, vLLM, LM
//! Studio and so on. Only the endpoint and model differ.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::Serialize;

use crate::config::{ApiKey, LlmConfig};

use super::{ByteStream, ChatTransport, ProviderError};

/// Chat message as sent on the wire
#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// Streaming chat completion request
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    stream: bool,
    messages: Vec<ChatMessage<'a>>,
}

pub struct OpenAiCompatTransport {
    client: Client,
    endpoint: String,
    model: String,
    system_prompt: String,
}

impl OpenAiCompatTransport {
    pub fn new(config: &LlmConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
        })
    }

    fn request<'a>(&'a self, prompt: &'a str) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.model,
            stream: true,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        }
    }
}

#[async_trait]
impl ChatTransport for OpenAiCompatTransport {
    async fn open_stream(&self, api_key: &ApiKey, prompt: &str) -> Result<ByteStream, ProviderError> {
        tracing::debug!(endpoint = %self.endpoint, model = %self.model, "Opening chat completion stream");

        let response = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", api_key.expose()))
            .json(&self.request(prompt))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "Upstream rejected chat request");
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ProviderError::from))
            .boxed())
    }
}
