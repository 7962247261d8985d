//! OpenAI-compatible chat completions (OpenAI and vLLM)

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{http_client, resolve_api_key, resolve_base_url, LlmClient, LlmResponse, Message};
use super::{Role, RetryPolicy};
use crate::config::{ClientConfig, GenerateKwargs};
use crate::error::ClientError;

pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model_id: String,
    generate_kwargs: GenerateKwargs,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiClient {
    pub fn new(config: &ClientConfig, retry: RetryPolicy) -> Result<Self, ClientError> {
        Ok(Self {
            client: http_client(config)?,
            base_url: resolve_base_url(config)?,
            api_key: resolve_api_key(config)?,
            model_id: config.model_id.clone(),
            generate_kwargs: config.generate_kwargs.clone(),
            retry,
        })
    }

    fn convert_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                match &msg.attachment {
                    None => json!({"role": role, "content": msg.content}),
                    Some(image) => json!({
                        "role": role,
                        "content": [
                            {"type": "text", "text": msg.content},
                            {"type": "image_url", "image_url": {"url": image.data_url()}},
                        ],
                    }),
                }
            })
            .collect()
    }

    async fn call(&self, messages: &[Message]) -> Result<LlmResponse, ClientError> {
        let body = json!({
            "model": self.model_id,
            "messages": Self::convert_messages(messages),
            "temperature": self.generate_kwargs.temperature,
            "max_tokens": self.generate_kwargs.max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::Transient(format!("HTTP {}: {}", status, text)));
        }

        let parsed: ChatResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Transient("response has no choices".into()))?;
        let usage = parsed.usage.unwrap_or_default();

        debug!(
            "completion: {} input / {} output tokens",
            usage.prompt_tokens, usage.completion_tokens
        );

        Ok(LlmResponse {
            model_id: parsed.model.unwrap_or_else(|| self.model_id.clone()),
            completion: choice.message.content.unwrap_or_default().trim().to_string(),
            stop_reason: choice.finish_reason.unwrap_or_else(|| "unknown".into()),
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            reasoning: None,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, messages: &[Message]) -> Result<LlmResponse, ClientError> {
        self.retry.run("generate", || self.call(messages)).await
    }
}
