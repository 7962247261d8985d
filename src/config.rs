//! Run Configuration
//!
//! Defines the configuration for an evaluation run:
//! - Environments to evaluate and their family-specific kwargs
//! - Task lists per environment
//! - Evaluation budget (episodes, steps, workers, ICL demos)
//! - Agent and LLM client settings
//!
//! Files are YAML or TOML, chosen by extension. Dotted `key=value` overrides
//! are applied to the raw tree before it is deserialized.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::agent::AgentKind;
use crate::env::EnvFamily;
use crate::error::ConfigError;
use crate::llm::Provider;

/// Complete run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    /// Environment selection and per-family kwargs
    #[serde(default)]
    pub envs: EnvsConfig,
    /// Task lists keyed as `<env_name>_tasks`
    #[serde(default)]
    pub tasks: BTreeMap<String, Vec<String>>,
    /// Evaluation budget and output layout
    #[serde(default)]
    pub eval: EvalSettings,
    /// Agent settings
    #[serde(default)]
    pub agent: AgentConfig,
    /// LLM client settings
    #[serde(default)]
    pub client: ClientConfig,
}

/// Environment selection
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnvsConfig {
    /// Environment names joined with `-`, e.g. `nle-minihack`
    #[serde(default)]
    pub names: String,
    #[serde(default)]
    pub env_kwargs: EnvKwargs,
    #[serde(default)]
    pub nle_kwargs: NleKwargs,
    #[serde(default)]
    pub minihack_kwargs: MiniHackKwargs,
    /// External environment server
    #[serde(default)]
    pub server: EnvServerConfig,
    /// Kwargs of the remaining families (`crafter_kwargs`, `babyai_kwargs`, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnvKwargs {
    /// Fixed episode seed; derived from the clock when unset
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NleKwargs {
    /// Character spec such as `Mon-Hum-Mal-Neu`, or `@` for random
    #[serde(default = "default_character")]
    pub character: String,
    /// Collapse `--More--` prompts inside the environment
    #[serde(default)]
    pub skip_more: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_character() -> String {
    "@".to_string()
}

impl Default for NleKwargs {
    fn default() -> Self {
        Self {
            character: default_character(),
            skip_more: false,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MiniHackKwargs {
    #[serde(default)]
    pub skip_more: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Command line of the process that hosts the game engines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvServerConfig {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_server_timeout")]
    pub timeout_secs: u64,
}

fn default_server_timeout() -> u64 {
    300
}

impl Default for EnvServerConfig {
    fn default() -> Self {
        Self {
            command: vec![],
            timeout_secs: default_server_timeout(),
        }
    }
}

/// Evaluation budget and output layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalSettings {
    /// Root under which fresh run directories are created
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Existing run directory to resume into
    #[serde(default)]
    pub resume_from: Option<PathBuf>,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Episodes per environment name
    #[serde(default)]
    pub num_episodes: BTreeMap<String, usize>,
    /// Overrides the environment's own step budget when set
    #[serde(default)]
    pub max_steps_per_episode: Option<u32>,
    /// Demonstrations replayed into ICL agents before each episode
    #[serde(default = "default_icl_episodes")]
    pub icl_episodes: usize,
    /// Demonstration root, relative to the original working directory
    #[serde(default = "default_icl_dataset")]
    pub icl_dataset: PathBuf,
    #[serde(default)]
    pub save_trajectories: bool,
    /// Draw progress bars
    #[serde(default = "default_true")]
    pub progress: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}
fn default_num_workers() -> usize {
    1
}
fn default_icl_episodes() -> usize {
    1
}
fn default_icl_dataset() -> PathBuf {
    PathBuf::from("records")
}
fn default_true() -> bool {
    true
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            resume_from: None,
            num_workers: default_num_workers(),
            num_episodes: BTreeMap::new(),
            max_steps_per_episode: None,
            icl_episodes: default_icl_episodes(),
            icl_dataset: default_icl_dataset(),
            save_trajectories: false,
            progress: true,
        }
    }
}

/// Agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(rename = "type", default)]
    pub kind: AgentKind,
    /// Observation/action pairs kept in the prompt
    #[serde(default = "default_max_text_history")]
    pub max_text_history: usize,
    /// Most recent frames attached to the prompt (0 = text only)
    #[serde(default)]
    pub max_image_history: usize,
    /// Previous reasoning traces kept in the prompt
    #[serde(default = "default_max_cot_history")]
    pub max_cot_history: usize,
    #[serde(default = "default_true")]
    pub remember_cot: bool,
    /// Commit replayed demonstrations to a provider-side cache
    #[serde(default)]
    pub cache_icl: bool,
}

fn default_max_text_history() -> usize {
    16
}
fn default_max_cot_history() -> usize {
    1
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            kind: AgentKind::default(),
            max_text_history: default_max_text_history(),
            max_image_history: 0,
            max_cot_history: default_max_cot_history(),
            remember_cot: true,
            cache_icl: false,
        }
    }
}

/// LLM client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub provider: Provider,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Never written into episode artifacts
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub generate_kwargs: GenerateKwargs,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff delay in seconds
    #[serde(default = "default_delay")]
    pub delay: f64,
}

fn default_model_id() -> String {
    "gpt-4o-mini".to_string()
}
fn default_timeout() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    5
}
fn default_delay() -> f64 {
    2.0
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model_id: default_model_id(),
            base_url: None,
            api_key: None,
            timeout: default_timeout(),
            generate_kwargs: GenerateKwargs::default(),
            max_retries: default_max_retries(),
            delay: default_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateKwargs {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.5
}
fn default_max_tokens() -> u32 {
    1024
}

impl Default for GenerateKwargs {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl EvalConfig {
    /// Load a config file and apply `key=value` overrides
    pub fn load(path: &Path, overrides: &[String]) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let parse_err = |reason: String| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        };

        let mut tree: Value = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
            _ => serde_yaml::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
        };
        if tree.is_null() {
            tree = Value::Object(Map::new());
        }

        for spec in overrides {
            apply_override(&mut tree, spec)?;
        }

        let config: Self = serde_json::from_value(tree).map_err(|e| parse_err(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document (no overrides)
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Environment names in configured order
    pub fn env_names(&self) -> Vec<String> {
        self.envs
            .names
            .split('-')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .collect()
    }

    /// Tasks configured for an environment
    pub fn tasks_for(&self, env_name: &str) -> &[String] {
        self.tasks
            .get(&format!("{}_tasks", env_name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Episodes to run per task, defaulting to one
    pub fn num_episodes_for(&self, env_name: &str) -> usize {
        self.eval.num_episodes.get(env_name).copied().unwrap_or(1)
    }

    /// Kwargs forwarded to the environment server for a family
    pub fn family_kwargs(&self, family: EnvFamily) -> Value {
        let value = match family {
            EnvFamily::Nle => serde_json::to_value(&self.envs.nle_kwargs).ok(),
            EnvFamily::MiniHack => serde_json::to_value(&self.envs.minihack_kwargs).ok(),
            other => self
                .envs
                .extra
                .get(&format!("{}_kwargs", other.as_str()))
                .cloned(),
        };
        value.unwrap_or_else(|| Value::Object(Map::new()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for name in self.env_names() {
            name.parse::<EnvFamily>()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if !self.client.delay.is_finite() || self.client.delay < 0.0 {
            return Err(ConfigError::Invalid(
                "client.delay must be a finite number >= 0".into(),
            ));
        }
        Ok(())
    }
}

/// Apply a dotted `a.b.c=value` override; the value is parsed as a YAML scalar
pub fn apply_override(root: &mut Value, spec: &str) -> Result<(), ConfigError> {
    let (key, raw) = spec
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidOverride(spec.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigError::InvalidOverride(spec.to_string()));
    }

    let value: Value = if raw.trim().is_empty() {
        Value::String(String::new())
    } else {
        serde_yaml::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    };

    let parts: Vec<&str> = key.split('.').collect();
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| ConfigError::InvalidOverride(spec.to_string()))?;

    let mut node = root;
    for part in parents {
        let obj = node
            .as_object_mut()
            .ok_or_else(|| ConfigError::InvalidOverride(spec.to_string()))?;
        node = obj
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if node.is_null() {
            *node = Value::Object(Map::new());
        }
    }

    node.as_object_mut()
        .ok_or_else(|| ConfigError::InvalidOverride(spec.to_string()))?
        .insert(last.to_string(), value);
    Ok(())
}
