//! Shared fixtures: a deterministic corridor environment and scripted agents

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use game_bench::agent::{Agent, AgentFactory, IclAgent};
use game_bench::env::{EnvFactory, Environment, Observation, StepOutcome, TextObservation};
use game_bench::llm::LlmResponse;
use game_bench::{ClientError, EnvError, EvalConfig};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};

pub const ACTIONS: [&str; 3] = ["left", "right", "wait"];

/// One-dimensional walk from 0 to a goal at `2 + seed % 3`
pub struct CorridorEnv {
    task: String,
    actions: Vec<String>,
    pos: i64,
    goal: i64,
    steps: u32,
    max_steps: u32,
    failed: u32,
}

impl CorridorEnv {
    pub fn new(task: &str, max_steps: u32) -> Self {
        Self {
            task: task.to_string(),
            actions: ACTIONS.iter().map(|a| a.to_string()).collect(),
            pos: 0,
            goal: 2,
            steps: 0,
            max_steps,
            failed: 0,
        }
    }

    fn observation(&self) -> Observation {
        Observation {
            text: TextObservation {
                long_term_context: format!("You are at {}. The goal is at {}.", self.pos, self.goal),
                short_term_context: String::new(),
            },
            image: None,
            obs: json!({
                "pos": self.pos,
                "goal": self.goal,
                "mission": format!("reach cell {}", self.goal),
            }),
        }
    }
}

#[async_trait]
impl Environment for CorridorEnv {
    async fn reset(&mut self, seed: Option<u64>) -> Result<Observation, EnvError> {
        self.goal = 2 + (seed.unwrap_or(0) % 3) as i64;
        self.pos = 0;
        self.steps = 0;
        Ok(self.observation())
    }

    async fn step(&mut self, action: &str) -> Result<StepOutcome, EnvError> {
        match action {
            "left" => self.pos = (self.pos - 1).max(0),
            "right" => self.pos += 1,
            "wait" => {}
            other => return Err(EnvError::Protocol(format!("unknown action {}", other))),
        }
        self.steps += 1;
        let reached = self.pos == self.goal;
        Ok(StepOutcome {
            observation: self.observation(),
            reward: if reached { 1.0 } else { 0.0 },
            terminated: reached,
            truncated: self.steps >= self.max_steps,
            info: Value::Null,
        })
    }

    async fn get_text_action(&mut self, raw: &Value) -> Result<String, EnvError> {
        match raw {
            Value::Number(n) => n
                .as_u64()
                .and_then(|i| self.actions.get(i as usize).cloned())
                .ok_or_else(|| EnvError::Protocol(format!("unknown action index {}", raw))),
            Value::String(s) => Ok(s.clone()),
            other => Err(EnvError::Protocol(format!("unknown action {}", other))),
        }
    }

    fn action_space(&self) -> &[String] {
        &self.actions
    }

    fn default_action(&self) -> &str {
        "wait"
    }

    async fn get_instruction_prompt(
        &mut self,
        instructions: Option<&str>,
    ) -> Result<String, EnvError> {
        Ok(format!(
            "Task: {}. Walk right until you reach the goal. Actions: left, right, wait.{}",
            self.task,
            instructions.map(|i| format!(" {}", i)).unwrap_or_default()
        ))
    }

    async fn get_stats(&mut self) -> Result<Map<String, Value>, EnvError> {
        let mut stats = Map::new();
        let progression = (self.pos as f64 / self.goal as f64).clamp(0.0, 1.0);
        stats.insert("progression".into(), json!(progression));
        Ok(stats)
    }

    fn max_steps(&self) -> u32 {
        self.max_steps
    }

    fn failed_candidates(&self) -> u32 {
        self.failed
    }

    fn record_failed_candidate(&mut self) {
        self.failed += 1;
    }
}

/// A `make` call seen by [`CorridorFactory`]
#[derive(Debug, Clone, PartialEq)]
pub struct MadeEnv {
    pub env_name: String,
    pub task: String,
    pub seed: Option<u64>,
}

pub struct CorridorFactory {
    pub max_steps: u32,
    pub made: Mutex<Vec<MadeEnv>>,
}

impl CorridorFactory {
    pub fn new(max_steps: u32) -> Arc<Self> {
        Arc::new(Self {
            max_steps,
            made: Mutex::new(vec![]),
        })
    }

    pub fn made(&self) -> Vec<MadeEnv> {
        self.made.lock().unwrap().clone()
    }
}

#[async_trait]
impl EnvFactory for CorridorFactory {
    async fn make(
        &self,
        env_name: &str,
        task: &str,
        config: &EvalConfig,
    ) -> Result<Box<dyn Environment>, EnvError> {
        self.made.lock().unwrap().push(MadeEnv {
            env_name: env_name.to_string(),
            task: task.to_string(),
            seed: config.envs.env_kwargs.seed,
        });
        Ok(Box::new(CorridorEnv::new(task, self.max_steps)))
    }
}

fn response(completion: &str) -> LlmResponse {
    LlmResponse {
        model_id: "scripted".into(),
        completion: completion.to_string(),
        stop_reason: "stop".into(),
        input_tokens: 10,
        output_tokens: 2,
        reasoning: None,
    }
}

/// Replays a fixed list of completions, repeating the last one
pub struct ScriptedAgent {
    script: Vec<String>,
    cursor: usize,
    pub instruction_prompt: String,
    pub prev_actions: Vec<Option<String>>,
    pub icl_observations: Vec<String>,
    pub icl_actions: Vec<String>,
    pub wrapped: usize,
    icl: bool,
}

impl ScriptedAgent {
    pub fn new(script: &[&str]) -> Self {
        Self {
            script: script.iter().map(|s| s.to_string()).collect(),
            cursor: 0,
            instruction_prompt: String::new(),
            prev_actions: vec![],
            icl_observations: vec![],
            icl_actions: vec![],
            wrapped: 0,
            icl: false,
        }
    }

    /// Also accept demonstration replay
    pub fn with_icl(mut self) -> Self {
        self.icl = true;
        self
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.prev_actions.clear();
        self.icl_observations.clear();
        self.icl_actions.clear();
        self.wrapped = 0;
    }

    fn update_instruction_prompt(&mut self, prompt: &str) {
        self.instruction_prompt = prompt.to_string();
    }

    async fn act(
        &mut self,
        _obs: &Observation,
        prev_action: Option<&str>,
    ) -> Result<LlmResponse, ClientError> {
        self.prev_actions.push(prev_action.map(String::from));
        let idx = self.cursor.min(self.script.len().saturating_sub(1));
        self.cursor += 1;
        let completion = self.script.get(idx).map(String::as_str).unwrap_or("wait");
        Ok(response(completion))
    }

    fn as_icl(&mut self) -> Option<&mut dyn IclAgent> {
        if self.icl {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl IclAgent for ScriptedAgent {
    fn update_icl_observation(&mut self, obs: &Observation) {
        self.icl_observations.push(obs.text.long_term_context.clone());
    }

    fn update_icl_action(&mut self, action: Option<&str>) {
        if let Some(action) = action {
            self.icl_actions.push(action.to_string());
        }
    }

    fn wrap_episode(&mut self) {
        self.wrapped += 1;
    }

    fn supports_cache(&self) -> bool {
        false
    }

    async fn cache_icl(&mut self) -> Result<(), ClientError> {
        Err(ClientError::Unsupported("ICL caching"))
    }
}

pub struct ScriptedAgentFactory {
    pub script: Vec<&'static str>,
    pub created: Mutex<usize>,
}

impl ScriptedAgentFactory {
    pub fn new(script: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            script: script.to_vec(),
            created: Mutex::new(0),
        })
    }

    pub fn created(&self) -> usize {
        *self.created.lock().unwrap()
    }
}

impl AgentFactory for ScriptedAgentFactory {
    fn create_agent(&self) -> Result<Box<dyn Agent>> {
        *self.created.lock().unwrap() += 1;
        Ok(Box::new(ScriptedAgent::new(&self.script)))
    }
}

/// Errors on the task named `broken`, panics on the task named `explode`
pub struct FlakyAgent {
    task_prompt: String,
}

#[async_trait]
impl Agent for FlakyAgent {
    fn name(&self) -> &str {
        "flaky"
    }

    fn reset(&mut self) {
        self.task_prompt.clear();
    }

    fn update_instruction_prompt(&mut self, prompt: &str) {
        self.task_prompt = prompt.to_string();
    }

    async fn act(
        &mut self,
        _obs: &Observation,
        _prev_action: Option<&str>,
    ) -> Result<LlmResponse, ClientError> {
        if self.task_prompt.starts_with("Task: broken.") {
            return Err(ClientError::Transient("scripted failure".into()));
        }
        if self.task_prompt.starts_with("Task: explode.") {
            panic!("scripted panic");
        }
        Ok(response("right"))
    }
}

pub struct FlakyAgentFactory;

impl AgentFactory for FlakyAgentFactory {
    fn create_agent(&self) -> Result<Box<dyn Agent>> {
        Ok(Box::new(FlakyAgent {
            task_prompt: String::new(),
        }))
    }
}

/// Every agent creation fails
pub struct BrokenAgentFactory;

impl AgentFactory for BrokenAgentFactory {
    fn create_agent(&self) -> Result<Box<dyn Agent>> {
        anyhow::bail!("no credentials for scripted provider")
    }
}

/// Minimal config for the corridor fixtures
pub fn corridor_config(env_names: &str, tasks: &[&str], episodes: usize, seed: u64) -> EvalConfig {
    let mut yaml = format!(
        "envs:\n  names: {names}\n  env_kwargs:\n    seed: {seed}\ntasks:\n",
        names = env_names,
        seed = seed
    );
    for env in env_names.split('-') {
        yaml.push_str(&format!("  {}_tasks: [{}]\n", env, tasks.join(", ")));
    }
    yaml.push_str("eval:\n  progress: false\n  icl_episodes: 0\n  num_episodes:\n");
    for env in env_names.split('-') {
        yaml.push_str(&format!("    {}: {}\n", env, episodes));
    }
    yaml.push_str("agent:\n  type: dummy\n");
    EvalConfig::from_yaml_str(&yaml).unwrap()
}

/// Write a recorded demonstration under `<root>/<env>/<task>/<name>`
pub fn write_demo(root: &std::path::Path, env: &str, task: &str, name: &str, actions: Value) {
    let dir = root.join(env).join(task);
    std::fs::create_dir_all(&dir).unwrap();
    let body = json!({ "actions": actions, "rewards": [] });
    std::fs::write(dir.join(name), serde_json::to_vec(&body).unwrap()).unwrap();
}
