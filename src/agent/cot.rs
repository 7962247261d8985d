//! Chain-of-thought agent
//!
//! Asks the model to reason step by step and finish with `ACTION: <action>`.
//! The full completion is kept as reasoning; the text after the last
//! `ACTION:` marker becomes the completion.

use async_trait::async_trait;

use super::{Agent, HistoryPromptBuilder};
use crate::env::Observation;
use crate::error::ClientError;
use crate::llm::{LlmClient, LlmResponse};

const COT_INSTRUCTIONS: &str = "First think about what's the best course of action step by step.\nFinally, provide a single output action at the end of the message in the form of: ACTION: <action>";

pub struct ChainOfThoughtAgent {
    client: Box<dyn LlmClient>,
    prompt_builder: HistoryPromptBuilder,
    remember_cot: bool,
}

impl ChainOfThoughtAgent {
    pub fn new(
        client: Box<dyn LlmClient>,
        prompt_builder: HistoryPromptBuilder,
        remember_cot: bool,
    ) -> Self {
        Self {
            client,
            prompt_builder,
            remember_cot,
        }
    }
}

/// Keep ASCII letters, whitespace and colons, then take what follows the
/// last `ACTION:` marker
pub fn extract_final_answer(completion: &str) -> String {
    let filtered: String = completion
        .chars()
        .filter(|c| c.is_ascii_alphabetic() || c.is_whitespace() || *c == ':')
        .collect();
    filtered
        .rsplit("ACTION:")
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

#[async_trait]
impl Agent for ChainOfThoughtAgent {
    fn name(&self) -> &str {
        "cot"
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
            last.content.push_str(COT_INSTRUCTIONS);
        }

        let mut response = self.client.generate(&messages).await?;
        if self.remember_cot {
            self.prompt_builder.update_reasoning(&response.completion);
        }
        response.reasoning = Some(response.completion.clone());
        response.completion = extract_final_answer(&response.completion);
        Ok(response)
    }
}
