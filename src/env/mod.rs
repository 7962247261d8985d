//! Environment boundary
//!
//! Game engines live outside this crate. They are reached through the
//! [`Environment`] trait and built per episode by an [`EnvFactory`].

pub mod external;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::config::EvalConfig;
use crate::error::EnvError;
use crate::llm::Image;

pub use external::{ExternalEnvFactory, ExternalEnvironment};

/// Supported environment families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvFamily {
    Nle,
    MiniHack,
    BabyAi,
    Crafter,
    TextWorld,
    BabaIsAi,
    Battleships,
}

impl EnvFamily {
    pub const ALL: [EnvFamily; 7] = [
        EnvFamily::Nle,
        EnvFamily::MiniHack,
        EnvFamily::BabyAi,
        EnvFamily::Crafter,
        EnvFamily::TextWorld,
        EnvFamily::BabaIsAi,
        EnvFamily::Battleships,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvFamily::Nle => "nle",
            EnvFamily::MiniHack => "minihack",
            EnvFamily::BabyAi => "babyai",
            EnvFamily::Crafter => "crafter",
            EnvFamily::TextWorld => "textworld",
            EnvFamily::BabaIsAi => "babaisai",
            EnvFamily::Battleships => "battleships",
        }
    }
}

impl FromStr for EnvFamily {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnvFamily::ALL
            .into_iter()
            .find(|family| family.as_str() == s)
            .ok_or_else(|| EnvError::UnknownFamily(s.to_string()))
    }
}

impl fmt::Display for EnvFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextObservation {
    #[serde(default)]
    pub long_term_context: String,
    #[serde(default)]
    pub short_term_context: String,
}

#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub text: TextObservation,
    pub image: Option<Image>,
    /// Engine-specific payload, opaque to the harness
    pub obs: Value,
}

impl Observation {
    /// The `mission` string of BabyAI observations
    pub fn mission(&self) -> Option<&str> {
        self.obs.get("mission").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub observation: Observation,
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
    pub info: Value,
}

impl StepOutcome {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// A single game instance
#[async_trait]
pub trait Environment: Send {
    async fn reset(&mut self, seed: Option<u64>) -> Result<Observation, EnvError>;

    async fn step(&mut self, action: &str) -> Result<StepOutcome, EnvError>;

    /// Convert a recorded action (index or name) into its text form
    async fn get_text_action(&mut self, raw: &Value) -> Result<String, EnvError>;

    fn action_space(&self) -> &[String];

    fn default_action(&self) -> &str;

    /// Return the completion if it names a valid action, otherwise the
    /// default action. Substitutions count as failed candidates.
    fn check_action_validity(&mut self, completion: &str) -> String {
        if self.action_space().iter().any(|a| a == completion) {
            return completion.to_string();
        }
        self.record_failed_candidate();
        self.default_action().to_string()
    }

    async fn get_instruction_prompt(
        &mut self,
        instructions: Option<&str>,
    ) -> Result<String, EnvError>;

    async fn get_stats(&mut self) -> Result<Map<String, Value>, EnvError>;

    fn max_steps(&self) -> u32;

    fn failed_candidates(&self) -> u32;

    fn record_failed_candidate(&mut self);

    async fn close(&mut self) -> Result<(), EnvError> {
        Ok(())
    }
}

/// Builds environments for an `(env_name, task)` pair
#[async_trait]
pub trait EnvFactory: Send + Sync {
    async fn make(
        &self,
        env_name: &str,
        task: &str,
        config: &EvalConfig,
    ) -> Result<Box<dyn Environment>, EnvError>;
}
