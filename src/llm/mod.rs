//! LLM provider clients
//!
//! Every provider sits behind [`LlmClient`]. The provider is chosen once from
//! `client.provider` and built by [`create_llm_client`].

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod retry;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::ClientError;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use openai::OpenAiClient;
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};

/// Supported LLM providers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenAi,
    Vllm,
    Gemini,
    #[serde(alias = "anthropic")]
    Claude,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Vllm => "vllm",
            Provider::Gemini => "gemini",
            Provider::Claude => "claude",
        }
    }

    /// Default API root for this provider
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("https://api.openai.com/v1"),
            Provider::Vllm => None,
            Provider::Gemini => Some("https://generativelanguage.googleapis.com"),
            Provider::Claude => Some("https://api.anthropic.com"),
        }
    }

    /// Environment variable holding the API key
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("OPENAI_API_KEY"),
            Provider::Vllm => None,
            Provider::Gemini => Some("GEMINI_API_KEY"),
            Provider::Claude => Some("ANTHROPIC_API_KEY"),
        }
    }
}

impl FromStr for Provider {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "vllm" => Ok(Provider::Vllm),
            "gemini" => Ok(Provider::Gemini),
            "claude" | "anthropic" => Ok(Provider::Claude),
            other => Err(ClientError::InvalidConfig(format!(
                "unknown provider: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Encoded PNG frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub png: Vec<u8>,
}

impl Image {
    pub fn from_png(png: Vec<u8>) -> Self {
        Self { png }
    }

    pub fn from_base64(data: &str) -> Result<Self, base64::DecodeError> {
        let png = base64::engine::general_purpose::STANDARD.decode(data)?;
        Ok(Self { png })
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.png)
    }

    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.to_base64())
    }
}

/// A single chat turn
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub attachment: Option<Image>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachment: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_attachment(mut self, image: Option<Image>) -> Self {
        self.attachment = image;
        self
    }
}

/// Normalized provider response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub model_id: String,
    pub completion: String,
    pub stop_reason: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// A chat-completion backend
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model_id(&self) -> &str;

    /// Generate one completion, retrying per the client's policy
    async fn generate(&self, messages: &[Message]) -> Result<LlmResponse, ClientError>;

    /// Whether [`LlmClient::cache_icl`] is available
    fn supports_icl_cache(&self) -> bool {
        false
    }

    /// Commit demonstration turns to a provider-side cache. Later
    /// generations reference it instead of resending the turns.
    async fn cache_icl(&mut self, _messages: &[Message]) -> Result<(), ClientError> {
        Err(ClientError::Unsupported("ICL caching"))
    }
}

/// Build the client for `config.provider`
pub fn create_llm_client(config: &ClientConfig) -> Result<Box<dyn LlmClient>, ClientError> {
    let retry = RetryPolicy::from_config(config);
    let client: Box<dyn LlmClient> = match config.provider {
        Provider::OpenAi | Provider::Vllm => Box::new(OpenAiClient::new(config, retry)?),
        Provider::Gemini => Box::new(GeminiClient::new(config, retry)?),
        Provider::Claude => Box::new(AnthropicClient::new(config, retry)?),
    };
    tracing::info!(
        "LLM client: provider={} model={}",
        config.provider,
        client.model_id()
    );
    Ok(client)
}

/// API key from the config, falling back to the provider's env var
pub(crate) fn resolve_api_key(config: &ClientConfig) -> Result<String, ClientError> {
    if let Some(key) = config.api_key.as_ref().filter(|k| !k.is_empty()) {
        return Ok(key.clone());
    }
    match config.provider.api_key_env() {
        Some(var) => std::env::var(var)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or(ClientError::MissingApiKey { env_var: var }),
        None => Ok("EMPTY".to_string()),
    }
}

pub(crate) fn resolve_base_url(config: &ClientConfig) -> Result<String, ClientError> {
    config
        .base_url
        .clone()
        .or_else(|| config.provider.default_base_url().map(String::from))
        .map(|url| url.trim_end_matches('/').to_string())
        .ok_or_else(|| {
            ClientError::InvalidConfig(format!(
                "client.base_url is required for provider {}",
                config.provider
            ))
        })
}

pub(crate) fn http_client(config: &ClientConfig) -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout))
        .build()
        .map_err(|e| ClientError::InvalidConfig(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse() {
        assert_eq!("openai".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert_eq!("Anthropic".parse::<Provider>().unwrap(), Provider::Claude);
        assert_eq!("vllm".parse::<Provider>().unwrap(), Provider::Vllm);
        assert!("bard".parse::<Provider>().is_err());

        let p: Provider = serde_json::from_str("\"anthropic\"").unwrap();
        assert_eq!(p, Provider::Claude);
        assert_eq!(serde_json::to_string(&Provider::OpenAi).unwrap(), "\"openai\"");
    }

    #[test]
    fn test_resolve_api_key_prefers_config() {
        let config = ClientConfig {
            provider: Provider::Gemini,
            api_key: Some("from-config".into()),
            ..Default::default()
        };
        assert_eq!(resolve_api_key(&config).unwrap(), "from-config");

        let vllm = ClientConfig {
            provider: Provider::Vllm,
            ..Default::default()
        };
        assert_eq!(resolve_api_key(&vllm).unwrap(), "EMPTY");
    }

    #[test]
    fn test_vllm_requires_base_url() {
        let config = ClientConfig {
            provider: Provider::Vllm,
            ..Default::default()
        };
        assert!(matches!(
            resolve_base_url(&config),
            Err(ClientError::InvalidConfig(_))
        ));

        let config = ClientConfig {
            provider: Provider::Vllm,
            base_url: Some("http://localhost:8000/v1/".into()),
            ..Default::default()
        };
        assert_eq!(resolve_base_url(&config).unwrap(), "http://localhost:8000/v1");
    }

    #[test]
    fn test_image_data_url() {
        let image = Image::from_png(vec![0x89, b'P', b'N', b'G']);
        assert!(image.data_url().starts_with("data:image/png;base64,"));
        assert_eq!(Image::from_base64(&image.to_base64()).unwrap(), image);
    }
}
