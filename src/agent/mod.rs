//! Agents
//!
//! An agent turns observations into LLM responses. Agents that learn from
//! replayed demonstrations also expose [`IclAgent`] through [`Agent::as_icl`].

pub mod cot;
pub mod dummy;
pub mod few_shot;
pub mod naive;
pub mod prompt;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::EvalConfig;
use crate::env::Observation;
use crate::error::ClientError;
use crate::llm::{create_llm_client, LlmResponse};

pub use cot::ChainOfThoughtAgent;
pub use dummy::DummyAgent;
pub use few_shot::FewShotAgent;
pub use naive::NaiveAgent;
pub use prompt::HistoryPromptBuilder;

/// Agent variants selectable through `agent.type`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    #[default]
    Naive,
    #[serde(alias = "chain_of_thought")]
    Cot,
    FewShot,
    Dummy,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Naive => "naive",
            AgentKind::Cot => "cot",
            AgentKind::FewShot => "few_shot",
            AgentKind::Dummy => "dummy",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Agent: Send {
    fn name(&self) -> &str;

    /// Clear per-episode state
    fn reset(&mut self);

    fn update_instruction_prompt(&mut self, prompt: &str);

    /// Produce the next response. `prev_action` is the previous raw completion.
    async fn act(
        &mut self,
        obs: &Observation,
        prev_action: Option<&str>,
    ) -> Result<LlmResponse, ClientError>;

    fn as_icl(&mut self) -> Option<&mut dyn IclAgent> {
        None
    }
}

/// Demonstration replay capability
#[async_trait]
pub trait IclAgent: Send {
    fn update_icl_observation(&mut self, obs: &Observation);

    fn update_icl_action(&mut self, action: Option<&str>);

    /// Close the demonstration currently being recorded
    fn wrap_episode(&mut self);

    fn supports_cache(&self) -> bool;

    async fn cache_icl(&mut self) -> Result<(), ClientError>;
}

/// Builds fresh agents; one per episode or one per worker
pub trait AgentFactory: Send + Sync {
    fn create_agent(&self) -> Result<Box<dyn Agent>>;
}

/// Builds the agent named by `agent.type` with a client for `client.provider`
pub struct ConfiguredAgentFactory {
    config: EvalConfig,
}

impl ConfiguredAgentFactory {
    pub fn new(config: EvalConfig) -> Self {
        Self { config }
    }
}

impl AgentFactory for ConfiguredAgentFactory {
    fn create_agent(&self) -> Result<Box<dyn Agent>> {
        let agent_config = &self.config.agent;
        if agent_config.kind == AgentKind::Dummy {
            return Ok(Box::new(DummyAgent::new()));
        }

        let client = create_llm_client(&self.config.client).with_context(|| {
            format!("Failed to create {} client", self.config.client.provider)
        })?;
        let builder = HistoryPromptBuilder::new(
            agent_config.max_text_history,
            agent_config.max_image_history,
            agent_config.max_cot_history,
        );

        let agent: Box<dyn Agent> = match agent_config.kind {
            AgentKind::Naive => Box::new(NaiveAgent::new(client, builder)),
            AgentKind::Cot => Box::new(ChainOfThoughtAgent::new(
                client,
                builder,
                agent_config.remember_cot,
            )),
            AgentKind::FewShot => Box::new(FewShotAgent::new(client, builder)),
            AgentKind::Dummy => Box::new(DummyAgent::new()),
        };
        Ok(agent)
    }
}
