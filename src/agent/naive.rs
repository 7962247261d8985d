//! Agent that asks for a bare action each step

use async_trait::async_trait;

use super::{Agent, HistoryPromptBuilder};
use crate::env::Observation;
use crate::error::ClientError;
use crate::llm::{LlmClient, LlmResponse};

const NAIVE_INSTRUCTIONS: &str = "You always have to output one of the above actions at a time and no other text. You always have to output an action until the episode terminates.";

pub struct NaiveAgent {
    client: Box<dyn LlmClient>,
    prompt_builder: HistoryPromptBuilder,
}

impl NaiveAgent {
    pub fn new(client: Box<dyn LlmClient>, prompt_builder: HistoryPromptBuilder) -> Self {
        Self {
            client,
            prompt_builder,
        }
    }
}

#[async_trait]
impl Agent for NaiveAgent {
    fn name(&self) -> &str {
        "naive"
    }

    fn reset(&mut self) {
        self.prompt_builder.reset();
    }

    fn update_instruction_prompt(&mut self, prompt: &str) {
        self.prompt_builder.update_instruction_prompt(prompt);
    }

    async fn act(
        &mut self,
        obs: &Observation,
        prev_action: Option<&str>,
    ) -> Result<LlmResponse, ClientError> {
        if let Some(prev) = prev_action {
            self.prompt_builder.update_action(prev);
        }
        self.prompt_builder.update_observation(obs);

        let mut messages = self.prompt_builder.get_prompt();
        if let Some(last) = messages.last_mut() {
            last.content.push_str("\n\n");
            last.content.push_str(NAIVE_INSTRUCTIONS);
        }

        let mut response = self.client.generate(&messages).await?;
        response.completion = response.completion.trim().to_string();
        Ok(response)
    }
}
