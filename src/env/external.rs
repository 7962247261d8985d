//! External environment server
//!
//! Game engines run in a child process (`envs.server.command`) that speaks a
//! JSON-lines protocol: one request per line on stdin, one response per line
//! on stdout.
//!
//! Requests carry an `op` tag: `make`, `reset`, `step`, `text_action`,
//! `instruction_prompt`, `stats`, `close`. Responses are `{"ok": true, ...}`
//! or `{"ok": false, "error": "..."}`. Images travel as base64 PNG.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::{EnvFactory, EnvFamily, Environment, Observation, StepOutcome, TextObservation};
use crate::config::EvalConfig;
use crate::error::EnvError;
use crate::llm::Image;

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Make {
        env_name: &'a str,
        task: &'a str,
        kwargs: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_steps: Option<u32>,
    },
    Reset {
        seed: Option<u64>,
    },
    Step {
        action: &'a str,
    },
    TextAction {
        action: &'a Value,
    },
    InstructionPrompt {
        instructions: Option<&'a str>,
    },
    Stats,
    Close,
}

#[derive(Debug, Deserialize)]
struct WireObservation {
    #[serde(default)]
    text: TextObservation,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    obs: Value,
}

impl WireObservation {
    fn into_observation(self) -> Result<Observation, EnvError> {
        let image = match self.image {
            Some(data) if !data.is_empty() => Some(
                Image::from_base64(&data)
                    .map_err(|e| EnvError::Protocol(format!("bad image payload: {}", e)))?,
            ),
            _ => None,
        };
        Ok(Observation {
            text: self.text,
            image,
            obs: self.obs,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MakeResponse {
    action_space: Vec<String>,
    default_action: String,
    max_steps: u32,
}

#[derive(Debug, Deserialize)]
struct ResetResponse {
    observation: WireObservation,
}

#[derive(Debug, Deserialize)]
struct StepResponse {
    observation: WireObservation,
    #[serde(default)]
    reward: f64,
    #[serde(default)]
    terminated: bool,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    info: Value,
}

#[derive(Debug, Deserialize)]
struct TextActionResponse {
    action: String,
}

#[derive(Debug, Deserialize)]
struct PromptResponse {
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    stats: Map<String, Value>,
}

/// An environment instance hosted by a child process
pub struct ExternalEnvironment {
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    timeout: Duration,
    action_space: Vec<String>,
    default_action: String,
    max_steps: u32,
    failed_candidates: u32,
}

impl ExternalEnvironment {
    /// Spawn the server and create the environment for `(env_name, task)`
    pub async fn spawn(
        command: &[String],
        env_name: &str,
        task: &str,
        kwargs: Value,
        max_steps: Option<u32>,
        timeout: Duration,
    ) -> Result<Self, EnvError> {
        let (program, args) = command.split_first().ok_or_else(|| {
            EnvError::Server("envs.server.command is empty".to_string())
        })?;

        debug!("Starting environment server: {} {:?}", program, args);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EnvError::Server("failed to open server stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EnvError::Server("failed to open server stdout".into()))?;

        let mut env = Self {
            name: format!("{}/{}", env_name, task),
            child,
            stdin,
            stdout: BufReader::new(stdout),
            timeout,
            action_space: vec![],
            default_action: String::new(),
            max_steps: 0,
            failed_candidates: 0,
        };

        let made: MakeResponse = env
            .call(&Request::Make {
                env_name,
                task,
                kwargs,
                max_steps,
            })
            .await?;
        env.action_space = made.action_space;
        env.default_action = made.default_action;
        env.max_steps = made.max_steps;

        info!(
            "Environment {} ready: {} actions, max {} steps",
            env.name,
            env.action_space.len(),
            env.max_steps
        );
        Ok(env)
    }

    async fn call<T: DeserializeOwned>(&mut self, request: &Request<'_>) -> Result<T, EnvError> {
        let line = serde_json::to_string(request)
            .map_err(|e| EnvError::Protocol(e.to_string()))?;
        debug!("-> {}: {}", self.name, log_preview(&line));

        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        let mut response_line = String::new();
        match tokio::time::timeout(self.timeout, self.stdout.read_line(&mut response_line)).await {
            Ok(Ok(0)) => {
                return Err(EnvError::Server(
                    "environment server closed stdout (EOF)".into(),
                ))
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(EnvError::Io(e)),
            Err(_) => return Err(EnvError::Timeout(self.timeout.as_secs())),
        }
        debug!("<- {}: {}", self.name, log_preview(&response_line));

        let value: Value = serde_json::from_str(response_line.trim()).map_err(|e| {
            EnvError::Protocol(format!("invalid response {:?}: {}", response_line.trim(), e))
        })?;

        if value.get("ok").and_then(Value::as_bool) != Some(true) {
            let message = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request failed without an error message");
            return Err(EnvError::Server(message.to_string()));
        }

        serde_json::from_value(value).map_err(|e| EnvError::Protocol(e.to_string()))
    }
}

const LOG_PREVIEW_CHARS: usize = 200;

/// First `LOG_PREVIEW_CHARS` characters of a protocol line
fn log_preview(line: &str) -> &str {
    match line.char_indices().nth(LOG_PREVIEW_CHARS) {
        Some((end, _)) => &line[..end],
        None => line,
    }
}

#[async_trait]
impl Environment for ExternalEnvironment {
    async fn reset(&mut self, seed: Option<u64>) -> Result<Observation, EnvError> {
        self.failed_candidates = 0;
        let response: ResetResponse = self.call(&Request::Reset { seed }).await?;
        response.observation.into_observation()
    }

    async fn step(&mut self, action: &str) -> Result<StepOutcome, EnvError> {
        let response: StepResponse = self.call(&Request::Step { action }).await?;
        Ok(StepOutcome {
            observation: response.observation.into_observation()?,
            reward: response.reward,
            terminated: response.terminated,
            truncated: response.truncated,
            info: response.info,
        })
    }

    async fn get_text_action(&mut self, raw: &Value) -> Result<String, EnvError> {
        if let Some(text) = raw.as_str() {
            if self.action_space.iter().any(|a| a == text) {
                return Ok(text.to_string());
            }
        }
        let response: TextActionResponse = self.call(&Request::TextAction { action: raw }).await?;
        Ok(response.action)
    }

    fn action_space(&self) -> &[String] {
        &self.action_space
    }

    fn default_action(&self) -> &str {
        &self.default_action
    }

    async fn get_instruction_prompt(
        &mut self,
        instructions: Option<&str>,
    ) -> Result<String, EnvError> {
        let response: PromptResponse = self
            .call(&Request::InstructionPrompt { instructions })
            .await?;
        Ok(response.prompt)
    }

    async fn get_stats(&mut self) -> Result<Map<String, Value>, EnvError> {
        let response: StatsResponse = self.call(&Request::Stats).await?;
        Ok(response.stats)
    }

    fn max_steps(&self) -> u32 {
        self.max_steps
    }

    fn failed_candidates(&self) -> u32 {
        self.failed_candidates
    }

    fn record_failed_candidate(&mut self) {
        self.failed_candidates += 1;
    }

    async fn close(&mut self) -> Result<(), EnvError> {
        let closed: Result<Value, EnvError> = self.call(&Request::Close).await;
        if let Err(e) = closed {
            warn!("Environment {} did not close cleanly: {}", self.name, e);
        }
        if let Err(e) = self.child.kill().await {
            debug!("Environment {} already exited: {}", self.name, e);
        }
        Ok(())
    }
}

/// Spawns one server process per environment instance
pub struct ExternalEnvFactory;

#[async_trait]
impl EnvFactory for ExternalEnvFactory {
    async fn make(
        &self,
        env_name: &str,
        task: &str,
        config: &EvalConfig,
    ) -> Result<Box<dyn Environment>, EnvError> {
        let family: EnvFamily = env_name.parse()?;
        let env = ExternalEnvironment::spawn(
            &config.envs.server.command,
            env_name,
            task,
            config.family_kwargs(family),
            config.eval.max_steps_per_episode,
            Duration::from_secs(config.envs.server.timeout_secs),
        )
        .await?;
        Ok(Box::new(env))
    }
}
