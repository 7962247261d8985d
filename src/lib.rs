//! Game Benchmark Harness
//!
//! Evaluates LLM agents on text/vision game environments (NetHack,
//! MiniHack, BabyAI, Crafter, TextWorld, Baba Is AI, Battleships) and logs
//! actions, rewards and token usage per episode.
//!
//! ## Module Structure
//!
//! - `config`: Run configuration (YAML/TOML with dotted overrides)
//! - `error`: Typed errors per subsystem
//! - `llm`: Provider clients with retry/backoff
//! - `env`: Environment boundary and the external server adapter
//! - `agent`: Naive, chain-of-thought, few-shot and dummy agents
//! - `dataset`: Recorded demonstrations for in-context learning
//! - `evaluator`: Single-episode driver and artifacts
//! - `manager`: Resumable work list and worker pool
//! - `results`: Per-environment summaries and export

pub mod agent;
pub mod config;
pub mod dataset;
pub mod env;
pub mod error;
pub mod evaluator;
pub mod llm;
pub mod manager;
pub mod results;

pub use agent::{Agent, AgentFactory, AgentKind, ConfiguredAgentFactory, IclAgent};
pub use config::EvalConfig;
pub use dataset::InContextDataset;
pub use env::{EnvFactory, EnvFamily, Environment, ExternalEnvFactory, Observation, StepOutcome};
pub use error::{ClientError, ConfigError, DatasetError, EnvError};
pub use evaluator::{EpisodeLog, Evaluator};
pub use llm::{create_llm_client, LlmClient, LlmResponse, Message, Provider};
pub use manager::{DispatchStats, EvaluatorManager, FailureRecord, RunResults, WorkItem};
pub use results::{collect_from_dir, ResultExporter, RunSummary};
