//! Gemini generateContent API, with context caching for ICL demonstrations

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::{http_client, resolve_api_key, resolve_base_url, LlmClient, LlmResponse, Message};
use super::{RetryPolicy, Role};
use crate::config::{ClientConfig, GenerateKwargs};
use crate::error::ClientError;

const CACHE_DISPLAY_NAME: &str = "ICL Demo";
const CACHE_SYSTEM_INSTRUCTION: &str =
    "You are an agent playing a game. Use the provided demonstration to learn how to play the game.";
const CACHE_TTL_SECS: u64 = 300 * 60;

pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model_id: String,
    generate_kwargs: GenerateKwargs,
    retry: RetryPolicy,
    /// Resource name of the cached demonstrations, once created
    cached_content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Debug, Deserialize)]
struct CachedContent {
    name: String,
}

impl GeminiClient {
    pub fn new(config: &ClientConfig, retry: RetryPolicy) -> Result<Self, ClientError> {
        Ok(Self {
            client: http_client(config)?,
            base_url: resolve_base_url(config)?,
            api_key: resolve_api_key(config)?,
            model_id: config.model_id.clone(),
            generate_kwargs: config.generate_kwargs.clone(),
            retry,
            cached_content: None,
        })
    }

    pub fn cached_content(&self) -> Option<&str> {
        self.cached_content.as_deref()
    }

    fn convert_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::Assistant => "model",
                    Role::System | Role::User => "user",
                };
                let mut parts = vec![json!({"text": msg.content})];
                if let Some(image) = &msg.attachment {
                    parts.push(json!({
                        "inline_data": {"mime_type": "image/png", "data": image.to_base64()},
                    }));
                }
                json!({"role": role, "parts": parts})
            })
            .collect()
    }

    /// Missing candidate, content or part yields an empty completion
    fn extract(&self, parsed: GenerateResponse) -> LlmResponse {
        let usage = parsed.usage_metadata.unwrap_or_default();
        let model_id = parsed.model_version.unwrap_or_else(|| self.model_id.clone());

        let Some(candidate) = parsed.candidates.into_iter().next() else {
            error!("Gemini response has no candidates");
            return LlmResponse {
                model_id,
                stop_reason: "unknown".into(),
                ..Default::default()
            };
        };
        let stop_reason = candidate.finish_reason.unwrap_or_else(|| "unknown".into());

        let text = candidate
            .content
            .and_then(|c| c.parts.into_iter().next())
            .and_then(|p| p.text);
        match text {
            Some(text) => LlmResponse {
                model_id,
                completion: text.trim().to_string(),
                stop_reason,
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
                reasoning: None,
            },
            None => {
                error!("Gemini candidate has no text part (finish reason: {})", stop_reason);
                LlmResponse {
                    model_id,
                    stop_reason: "unknown".into(),
                    ..Default::default()
                }
            }
        }
    }

    async fn call(&self, messages: &[Message]) -> Result<LlmResponse, ClientError> {
        let mut body = json!({
            "contents": Self::convert_messages(messages),
            "generationConfig": {
                "temperature": self.generate_kwargs.temperature,
                "maxOutputTokens": self.generate_kwargs.max_tokens,
            },
        });
        if let Some(name) = &self.cached_content {
            body["cachedContent"] = json!(name);
        }

        let response = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, self.model_id
            ))
            .query(&[("key", &self.api_key)])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::Transient(format!("HTTP {}: {}", status, text)));
        }

        let parsed: GenerateResponse = response.json().await?;
        Ok(self.extract(parsed))
    }

    async fn create_cache(&self, messages: &[Message]) -> Result<String, ClientError> {
        let body = json!({
            "model": format!("models/{}", self.model_id),
            "displayName": CACHE_DISPLAY_NAME,
            "systemInstruction": {"parts": [{"text": CACHE_SYSTEM_INSTRUCTION}]},
            "contents": Self::convert_messages(messages),
            "ttl": format!("{}s", CACHE_TTL_SECS),
        });

        let response = self
            .client
            .post(format!("{}/v1beta/cachedContents", self.base_url))
            .query(&[("key", &self.api_key)])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::Transient(format!("HTTP {}: {}", status, text)));
        }

        let cached: CachedContent = response.json().await?;
        Ok(cached.name)
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, messages: &[Message]) -> Result<LlmResponse, ClientError> {
        self.retry.run("generate", || self.call(messages)).await
    }

    fn supports_icl_cache(&self) -> bool {
        true
    }

    async fn cache_icl(&mut self, messages: &[Message]) -> Result<(), ClientError> {
        let name = {
            let this = &*self;
            this.retry
                .run("cache_icl", || this.create_cache(messages))
                .await?
        };
        info!("Cached {} ICL messages as {}", messages.len(), name);
        self.cached_content = Some(name);
        Ok(())
    }
}
