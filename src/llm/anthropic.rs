//! Anthropic Messages API

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{http_client, resolve_api_key, resolve_base_url, LlmClient, LlmResponse, Message};
use super::{RetryPolicy, Role};
use crate::config::{ClientConfig, GenerateKwargs};
use crate::error::ClientError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    client: Client,
    base_url: String,
    api_key: String,
    model_id: String,
    generate_kwargs: GenerateKwargs,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicClient {
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

    /// The system prompt is sent as a user turn acknowledged by the assistant
    fn convert_messages(messages: &[Message]) -> Vec<Value> {
        let mut converted = Vec::with_capacity(messages.len() + 1);
        for msg in messages {
            let mut parts = vec![json!({"type": "text", "text": msg.content})];
            if let Some(image) = &msg.attachment {
                parts.push(json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": "image/png",
                        "data": image.to_base64(),
                    },
                }));
            }
            match msg.role {
                Role::System => {
                    converted.push(json!({"role": "user", "content": parts}));
                    converted.push(json!({
                        "role": "assistant",
                        "content": [{"type": "text", "text": "I'm ready!"}],
                    }));
                }
                Role::User => converted.push(json!({"role": "user", "content": parts})),
                Role::Assistant => converted.push(json!({"role": "assistant", "content": parts})),
            }
        }
        converted
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
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::Transient(format!("HTTP {}: {}", status, text)));
        }

        let parsed: MessagesResponse = response.json().await?;
        let completion: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        Ok(LlmResponse {
            model_id: parsed.model.unwrap_or_else(|| self.model_id.clone()),
            completion: completion.trim().to_string(),
            stop_reason: parsed.stop_reason.unwrap_or_else(|| "unknown".into()),
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            reasoning: None,
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, messages: &[Message]) -> Result<LlmResponse, ClientError> {
        self.retry.run("generate", || self.call(messages)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::retry::tests::instant_policy;
    use crate::llm::{Image, Provider};
    use httpmock::prelude::*;

    #[test]
    fn test_system_becomes_user_then_ack() {
        let converted = AnthropicClient::convert_messages(&[
            Message::system("rules"),
            Message::user("obs"),
        ]);

        assert_eq!(converted.len(), 3);
        assert_eq!(converted[0]["role"], "user");
        assert_eq!(converted[0]["content"][0]["text"], "rules");
        assert_eq!(converted[1]["role"], "assistant");
        assert_eq!(converted[1]["content"][0]["text"], "I'm ready!");
        assert_eq!(converted[2]["role"], "user");
    }

    #[test]
    fn test_image_part() {
        let converted = AnthropicClient::convert_messages(&[
            Message::user("frame").with_attachment(Some(Image::from_png(vec![7]))),
        ]);
        let image = &converted[0]["content"][1];
        assert_eq!(image["type"], "image");
        assert_eq!(image["source"]["media_type"], "image/png");
        assert_eq!(image["source"]["data"], "Bw==");
    }

    #[tokio::test]
    async fn test_generate() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/messages")
                    .header("x-api-key", "ant-test")
                    .header("anthropic-version", ANTHROPIC_VERSION);
                then.status(200).json_body(json!({
                    "model": "claude-3-5-sonnet-20241022",
                    "content": [{"type": "text", "text": "ACTION: east"}],
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 100, "output_tokens": 5}
                }));
            })
            .await;

        let config = ClientConfig {
            provider: Provider::Claude,
            model_id: "claude-3-5-sonnet-20241022".into(),
            base_url: Some(server.base_url()),
            api_key: Some("ant-test".into()),
            ..Default::default()
        };
        let client = AnthropicClient::new(&config, instant_policy(0)).unwrap();
        let response = client.generate(&[Message::user("go")]).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.completion, "ACTION: east");
        assert_eq!(response.stop_reason, "end_turn");
        assert_eq!(response.input_tokens, 100);
        assert_eq!(response.output_tokens, 5);
    }
}
