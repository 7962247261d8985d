//! Single-episode evaluator
//!
//! Drives one episode of `(env_name, task)` with an agent: optional ICL
//! replay, the step loop, a per-step CSV log and the final JSON artifact.

use anyhow::{Context, Result};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::agent::{Agent, IclAgent};
use crate::config::EvalConfig;
use crate::dataset::{load_actions, InContextDataset};
use crate::env::{EnvFactory, EnvFamily, Environment};

/// Per-episode artifact, written once at episode end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeLog {
    pub task: String,
    /// Live actions after validation; sums to `num_steps`
    pub action_frequency: BTreeMap<String, u64>,
    /// Actions replayed from demonstrations
    #[serde(default)]
    pub icl_action_frequency: BTreeMap<String, u64>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub done: bool,
    pub episode_return: f64,
    pub num_steps: u32,
    pub failed_candidates: u32,
    pub process_num: Option<usize>,
    pub seed: u64,
    pub agent: Value,
    pub client: Value,
    /// `(long-term context, action)` per live step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trajectory: Option<Vec<(String, String)>>,
    /// Environment stats such as `progression`
    #[serde(flatten)]
    pub stats: Map<String, Value>,
}

impl EpisodeLog {
    /// Keys serialized by the fixed fields; stats sharing them are dropped
    const FIELDS: [&'static str; 14] = [
        "task",
        "action_frequency",
        "icl_action_frequency",
        "input_tokens",
        "output_tokens",
        "done",
        "episode_return",
        "num_steps",
        "failed_candidates",
        "process_num",
        "seed",
        "agent",
        "client",
        "trajectory",
    ];

    pub fn progression(&self) -> Option<f64> {
        self.stats.get("progression").and_then(Value::as_f64)
    }

    /// Store environment stats. A stat named like a log field would
    /// duplicate the key in the flattened JSON, so it is skipped.
    pub fn set_stats(&mut self, stats: Map<String, Value>) {
        self.stats = stats
            .into_iter()
            .filter(|(key, value)| {
                let collides = Self::FIELDS.contains(&key.as_str());
                if collides {
                    warn!("Ignoring environment stat {:?} = {} (shadows a log field)", key, value);
                }
                !collides
            })
            .collect();
    }
}

/// `<output_dir>/<env_name>/<task>/<task>_run_<idx:02>.<ext>`
pub fn episode_artifact_path(
    output_dir: &Path,
    env_name: &str,
    task: &str,
    episode_idx: usize,
    ext: &str,
) -> PathBuf {
    output_dir
        .join(env_name)
        .join(task)
        .join(format!("{}_run_{:02}.{}", task, episode_idx, ext))
}

/// Microseconds since the epoch, folded into 32 bits
pub fn seed_from_timestamp() -> u64 {
    (Utc::now().timestamp_micros() as u64) % (1u64 << 32)
}

/// Reward formatted with at least one decimal
pub fn format_reward(reward: f64) -> String {
    if reward.is_finite() && reward.fract() == 0.0 && reward.abs() < 1e16 {
        format!("{:.1}", reward)
    } else {
        format!("{}", reward)
    }
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Step log flushed after every row
struct StepCsv {
    writer: BufWriter<File>,
}

impl StepCsv {
    const HEADER: [&'static str; 6] = ["Step", "Observation", "Action", "Reasoning", "Reward", "Done"];

    fn create(path: &Path) -> std::io::Result<Self> {
        let mut csv = Self {
            writer: BufWriter::new(File::create(path)?),
        };
        csv.write_row(&Self::HEADER)?;
        Ok(csv)
    }

    fn write_row(&mut self, fields: &[&str]) -> std::io::Result<()> {
        let line = fields
            .iter()
            .map(|f| csv_field(f))
            .collect::<Vec<_>>()
            .join(",");
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

/// Serialize to a temp file in the target directory, then rename over `path`
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .context("artifact path has no parent directory")?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to persist {}", path.display()))?;
    Ok(())
}

/// Runs episodes of one environment
pub struct Evaluator {
    env_name: String,
    family: EnvFamily,
    config: EvalConfig,
    env_factory: Arc<dyn EnvFactory>,
    dataset: InContextDataset,
    output_dir: PathBuf,
}

impl Evaluator {
    pub fn new(
        env_name: &str,
        config: EvalConfig,
        env_factory: Arc<dyn EnvFactory>,
        original_cwd: &Path,
        output_dir: &Path,
    ) -> Result<Self> {
        let env_name = env_name.trim();
        let family: EnvFamily = env_name.parse()?;
        let dataset = InContextDataset::new(&config, env_name, original_cwd)?;
        Ok(Self {
            env_name: env_name.to_string(),
            family,
            config,
            env_factory,
            dataset,
            output_dir: output_dir.to_path_buf(),
        })
    }

    pub fn env_name(&self) -> &str {
        &self.env_name
    }

    pub fn tasks(&self) -> &[String] {
        self.config.tasks_for(&self.env_name)
    }

    pub fn num_episodes(&self) -> usize {
        self.config.num_episodes_for(&self.env_name)
    }

    pub fn artifact_path(&self, task: &str, episode_idx: usize, ext: &str) -> PathBuf {
        episode_artifact_path(&self.output_dir, &self.env_name, task, episode_idx, ext)
    }

    /// Run one episode and write its artifacts
    #[instrument(skip(self, agent), fields(env = %self.env_name))]
    pub async fn run_episode(
        &self,
        task: &str,
        agent: &mut dyn Agent,
        episode_idx: usize,
        process_num: Option<usize>,
    ) -> Result<EpisodeLog> {
        let mut env = self
            .env_factory
            .make(&self.env_name, task, &self.config)
            .await
            .with_context(|| format!("Failed to create {} environment for {}", self.env_name, task))?;
        agent.reset();

        let seed = self
            .config
            .envs
            .env_kwargs
            .seed
            .unwrap_or_else(seed_from_timestamp);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut obs = env.reset(Some(seed)).await.context("Environment reset failed")?;

        let instructions = match self.family {
            EnvFamily::BabyAi => obs.mission().map(String::from),
            _ => None,
        };
        let instruction_prompt = env
            .get_instruction_prompt(instructions.as_deref())
            .await
            .context("Failed to get instruction prompt")?;
        agent.update_instruction_prompt(&instruction_prompt);

        let mut log = EpisodeLog {
            task: task.to_string(),
            action_frequency: BTreeMap::new(),
            icl_action_frequency: BTreeMap::new(),
            input_tokens: 0,
            output_tokens: 0,
            done: false,
            episode_return: 0.0,
            num_steps: 0,
            failed_candidates: 0,
            process_num,
            seed,
            agent: serde_json::to_value(&self.config.agent)?,
            client: serde_json::to_value(&self.config.client)?,
            trajectory: self.config.eval.save_trajectories.then(Vec::new),
            stats: Map::new(),
        };

        let csv_path = self.artifact_path(task, episode_idx, "csv");
        if let Some(dir) = csv_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let mut csv = StepCsv::create(&csv_path)
            .with_context(|| format!("Failed to create {}", csv_path.display()))?;

        if let Some(icl) = agent.as_icl() {
            for i in 0..self.config.eval.icl_episodes {
                self.load_icl_episode(i, task, icl, &mut log, seed, &mut rng)
                    .await
                    .with_context(|| format!("ICL replay {} failed", i))?;
            }
            if self.config.agent.cache_icl && icl.supports_cache() {
                icl.cache_icl().await.context("Failed to cache ICL demonstrations")?;
            }
        }

        let max_steps = self
            .config
            .eval
            .max_steps_per_episode
            .unwrap_or_else(|| env.max_steps());
        info!("Starting {} episode {} (seed {}, max {} steps)", task, episode_idx, seed, max_steps);

        let mut prev_action: Option<String> = None;
        for step in 0..max_steps {
            let response = agent
                .act(&obs, prev_action.as_deref())
                .await
                .with_context(|| format!("Agent failed at step {}", step))?;
            let action = env.check_action_validity(&response.completion);

            *log.action_frequency.entry(action.clone()).or_default() += 1;
            log.input_tokens += response.input_tokens;
            log.output_tokens += response.output_tokens;
            if let Some(trajectory) = log.trajectory.as_mut() {
                trajectory.push((obs.text.long_term_context.clone(), action.clone()));
            }

            let outcome = env
                .step(&action)
                .await
                .with_context(|| format!("Environment step {} failed", step))?;
            let done = outcome.done();
            log.num_steps += 1;
            log.episode_return += outcome.reward;

            obs = outcome.observation;
            if action != response.completion {
                debug!("Invalid action {:?}, defaulted to {}", response.completion, action);
                obs.text.long_term_context = format!(
                    "\n\nYour previous output action: '{}' is not a valid action. Defaulted to action: {}\n{}",
                    response.completion, action, obs.text.long_term_context
                );
            }

            let step_field = step.to_string();
            let reward_field = format_reward(outcome.reward);
            csv.write_row(&[
                step_field.as_str(),
                obs.text.long_term_context.as_str(),
                response.completion.as_str(),
                response.reasoning.as_deref().unwrap_or_default(),
                reward_field.as_str(),
                if done { "True" } else { "False" },
            ])
            .with_context(|| format!("Failed to write {}", csv_path.display()))?;

            prev_action = Some(response.completion);

            if done {
                info!("Episode done with reward: {}", log.episode_return);
                log.done = true;
                break;
            }
        }

        log.failed_candidates = env.failed_candidates();
        log.set_stats(env.get_stats().await.context("Failed to collect stats")?);
        if let Err(e) = env.close().await {
            warn!("Failed to close environment: {}", e);
        }

        let json_path = self.artifact_path(task, episode_idx, "json");
        write_json_atomic(&json_path, &log)?;
        debug!("Wrote {}", json_path.display());

        Ok(log)
    }

    /// Replay one recorded demonstration into the agent
    async fn load_icl_episode(
        &self,
        i: usize,
        task: &str,
        icl: &mut dyn IclAgent,
        log: &mut EpisodeLog,
        live_seed: u64,
        rng: &mut StdRng,
    ) -> Result<()> {
        let demo_task = self.dataset.pick_demo_task(task, rng);
        let demo_path = self
            .dataset
            .pick_demo_path(i, &demo_task, &self.config, live_seed, rng)?;
        let demo_config = self.dataset.override_incontext_config(&self.config, &demo_path)?;
        let actions = load_actions(&demo_path)?;
        debug!("Replaying {} ({} actions)", demo_path.display(), actions.len());

        let mut env: Box<dyn Environment> = self
            .env_factory
            .make(&self.env_name, &demo_task, &demo_config)
            .await
            .with_context(|| format!("Failed to create demo environment for {}", demo_task))?;
        let mut obs = env.reset(demo_config.envs.env_kwargs.seed).await?;

        let mut done = false;
        for raw in actions {
            let Some(raw) = raw else { break };
            let text_action = env.get_text_action(&raw).await?;

            icl.update_icl_observation(&obs);
            icl.update_icl_action(Some(&text_action));
            *log.icl_action_frequency.entry(text_action.clone()).or_default() += 1;

            let outcome = env.step(&text_action).await?;
            done = outcome.done();
            obs = outcome.observation;
            if done {
                break;
            }
        }

        if !done {
            warn!("ICL trajectory {} ended without done", demo_path.display());
        }
        icl.wrap_episode();

        if let Err(e) = env.close().await {
            warn!("Failed to close demo environment: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_reward() {
        assert_eq!(format_reward(0.0), "0.0");
        assert_eq!(format_reward(1.0), "1.0");
        assert_eq!(format_reward(-3.0), "-3.0");
        assert_eq!(format_reward(0.25), "0.25");
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("north"), "north");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("line1\nline2"), "\"line1\nline2\"");
    }

    #[test]
    fn test_artifact_path() {
        let path = episode_artifact_path(Path::new("out"), "babaisai", "env/goto_win", 3, "json");
        assert_eq!(path, Path::new("out/babaisai/env/goto_win/env/goto_win_run_03.json"));
    }

    #[test]
    fn test_timestamp_seed_fits_32_bits() {
        assert!(seed_from_timestamp() < (1u64 << 32));
    }

    #[test]
    fn test_episode_log_flattens_stats() {
        let mut stats = Map::new();
        stats.insert("progression".into(), Value::from(0.75));
        let log = EpisodeLog {
            task: "t".into(),
            action_frequency: BTreeMap::from([("wait".to_string(), 2)]),
            icl_action_frequency: BTreeMap::new(),
            input_tokens: 2,
            output_tokens: 2,
            done: false,
            episode_return: 0.0,
            num_steps: 2,
            failed_candidates: 0,
            process_num: None,
            seed: 1,
            agent: Value::Null,
            client: Value::Null,
            trajectory: None,
            stats,
        };

        let json = serde_json::to_value(&log).unwrap();
        assert_eq!(json["progression"], 0.75);
        assert!(json.get("trajectory").is_none());

        let back: EpisodeLog = serde_json::from_value(json).unwrap();
        assert_eq!(back.progression(), Some(0.75));
        assert_eq!(back, log);
    }

    #[test]
    fn test_stats_shadowing_fields_are_dropped() {
        let mut log: EpisodeLog = serde_json::from_value(serde_json::json!({
            "task": "default",
            "action_frequency": {"noop": 3},
            "input_tokens": 9,
            "output_tokens": 3,
            "done": false,
            "episode_return": 0.0,
            "num_steps": 3,
            "failed_candidates": 0,
            "process_num": null,
            "seed": 5,
            "agent": {"type": "naive"},
            "client": {"model_id": "gpt-4o-mini"}
        }))
        .unwrap();

        let mut stats = Map::new();
        stats.insert("done".into(), Value::Bool(true));
        stats.insert("seed".into(), Value::from(99));
        stats.insert("progression".into(), Value::from(0.5));
        log.set_stats(stats);
        assert_eq!(log.stats.len(), 1);

        let dir = tempfile::tempdir().unwrap();
        let path = episode_artifact_path(dir.path(), "crafter", "default", 0, "json");
        write_json_atomic(&path, &log).unwrap();

        let collected = crate::results::collect_from_dir(dir.path()).unwrap();
        let back = &collected["crafter"][0];
        assert!(!back.done);
        assert_eq!(back.seed, 5);
        assert_eq!(back.progression(), Some(0.5));
    }

    #[test]
    fn test_write_json_atomic_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/log.json");
        write_json_atomic(&path, &serde_json::json!({"v": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"v": 2})).unwrap();

        let content: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(content["v"], 2);
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }
}
