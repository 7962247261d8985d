//! Agent that always waits. Useful for exercising the harness offline.

use async_trait::async_trait;

use super::Agent;
use crate::env::Observation;
use crate::error::ClientError;
use crate::llm::LlmResponse;

#[derive(Debug, Default)]
pub struct DummyAgent;

impl DummyAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Agent for DummyAgent {
    fn name(&self) -> &str {
        "dummy"
    }

    fn reset(&mut self) {}

    fn update_instruction_prompt(&mut self, _prompt: &str) {}

    async fn act(
        &mut self,
        _obs: &Observation,
        _prev_action: Option<&str>,
    ) -> Result<LlmResponse, ClientError> {
        Ok(LlmResponse {
            model_id: "dummy".into(),
            completion: "wait".into(),
            stop_reason: "none".into(),
            input_tokens: 1,
            output_tokens: 1,
            reasoning: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_always_waits() {
        let mut agent = DummyAgent::new();
        let response = agent.act(&Observation::default(), Some("east")).await.unwrap();
        assert_eq!(response.completion, "wait");
        assert_eq!(response.input_tokens + response.output_tokens, 2);
        assert!(response.reasoning.is_none());
    }
}
