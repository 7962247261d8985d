//! Few-shot agent: replayed demonstrations are prepended to the live history

use async_trait::async_trait;
use tracing::debug;

use super::{Agent, HistoryPromptBuilder, IclAgent};
use crate::env::Observation;
use crate::error::ClientError;
use crate::llm::{LlmClient, LlmResponse, Message};

const TURN_MARKER: &str = "**Now it's your turn to play the game!**";
const NAIVE_INSTRUCTIONS: &str = "You always have to output one of the above actions at a time and no other text. You always have to output an action until the episode terminates.";

pub struct FewShotAgent {
    client: Box<dyn LlmClient>,
    prompt_builder: HistoryPromptBuilder,
    /// Completed demonstrations
    icl_messages: Vec<Message>,
    /// Demonstration being recorded
    current_episode: Vec<Message>,
    demos: usize,
    /// Demonstrations live in the provider cache and are not resent
    cached: bool,
}

impl FewShotAgent {
    pub fn new(client: Box<dyn LlmClient>, prompt_builder: HistoryPromptBuilder) -> Self {
        Self {
            client,
            prompt_builder,
            icl_messages: vec![],
            current_episode: vec![],
            demos: 0,
            cached: false,
        }
    }

    pub fn demo_messages(&self) -> &[Message] {
        &self.icl_messages
    }

    fn build_prompt(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.prompt_builder.system_message().into_iter().collect();
        if !self.cached {
            messages.extend(self.icl_messages.iter().cloned());
        }

        let mut history = self.prompt_builder.history_messages();
        if self.demos > 0 {
            if let Some(first) = history.first_mut() {
                first.content = format!("{}\n\n{}", TURN_MARKER, first.content);
            }
        }
        messages.extend(history);
        messages
    }
}

#[async_trait]
impl Agent for FewShotAgent {
    fn name(&self) -> &str {
        "few_shot"
    }

    fn reset(&mut self) {
        self.prompt_builder.reset();
        self.icl_messages.clear();
        self.current_episode.clear();
        self.demos = 0;
        self.cached = false;
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

        let mut messages = self.build_prompt();
        if let Some(last) = messages.last_mut() {
            last.content.push_str("\n\n");
            last.content.push_str(NAIVE_INSTRUCTIONS);
        }

        let mut response = self.client.generate(&messages).await?;
        response.completion = response.completion.trim().to_string();
        Ok(response)
    }

    fn as_icl(&mut self) -> Option<&mut dyn IclAgent> {
        Some(self)
    }
}

#[async_trait]
impl IclAgent for FewShotAgent {
    fn update_icl_observation(&mut self, obs: &Observation) {
        let content = if obs.text.short_term_context.is_empty() {
            format!("Observation:\n{}", obs.text.long_term_context)
        } else {
            format!(
                "Observation:\n{}\n{}",
                obs.text.long_term_context, obs.text.short_term_context
            )
        };
        self.current_episode.push(Message::user(content));
    }

    fn update_icl_action(&mut self, action: Option<&str>) {
        if let Some(action) = action {
            self.current_episode.push(Message::assistant(action));
        }
    }

    fn wrap_episode(&mut self) {
        if self.current_episode.is_empty() {
            return;
        }
        self.demos += 1;
        let mut episode = std::mem::take(&mut self.current_episode);
        if let Some(first) = episode.first_mut() {
            first.content = format!("Demonstration {}:\n{}", self.demos, first.content);
        }
        debug!("Recorded demonstration {} ({} turns)", self.demos, episode.len());
        self.icl_messages.extend(episode);
    }

    fn supports_cache(&self) -> bool {
        self.client.supports_icl_cache()
    }

    async fn cache_icl(&mut self) -> Result<(), ClientError> {
        self.client.cache_icl(&self.icl_messages).await?;
        self.cached = true;
        Ok(())
    }
}
