//! Run summaries and export

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::evaluator::EpisodeLog;
use crate::manager::FailureRecord;

/// Statistics for one environment
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EnvSummary {
    pub env_name: String,
    pub episodes: u32,
    pub failures: u32,
    pub done: u32,
    /// Mean and population std of `progression`, over episodes reporting it
    pub progression_mean: Option<f64>,
    pub progression_std: Option<f64>,
    pub average_return: f64,
    pub average_steps: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub failed_candidates: u64,
}

impl EnvSummary {
    pub fn from_logs(env_name: &str, logs: &[EpisodeLog], failures: u32) -> Self {
        let n = logs.len() as f64;
        let mean = |total: f64| if logs.is_empty() { 0.0 } else { total / n };

        let progressions: Vec<f64> = logs.iter().filter_map(EpisodeLog::progression).collect();
        let (progression_mean, progression_std) = if progressions.is_empty() {
            (None, None)
        } else {
            let count = progressions.len() as f64;
            let m = progressions.iter().sum::<f64>() / count;
            let var = progressions.iter().map(|p| (p - m).powi(2)).sum::<f64>() / count;
            (Some(m), Some(var.sqrt()))
        };

        Self {
            env_name: env_name.to_string(),
            episodes: logs.len() as u32,
            failures,
            done: logs.iter().filter(|l| l.done).count() as u32,
            progression_mean,
            progression_std,
            average_return: mean(logs.iter().map(|l| l.episode_return).sum()),
            average_steps: mean(logs.iter().map(|l| l.num_steps as f64).sum()),
            total_input_tokens: logs.iter().map(|l| l.input_tokens).sum(),
            total_output_tokens: logs.iter().map(|l| l.output_tokens).sum(),
            failed_candidates: logs.iter().map(|l| l.failed_candidates as u64).sum(),
        }
    }
}

/// Summary of a whole run directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub name: String,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub envs: Vec<EnvSummary>,
    pub failures: Vec<FailureRecord>,
}

impl RunSummary {
    pub fn new(
        name: &str,
        by_env: &BTreeMap<String, Vec<EpisodeLog>>,
        failures: &[FailureRecord],
    ) -> Self {
        let mut failure_counts: BTreeMap<&str, u32> = BTreeMap::new();
        for f in failures {
            *failure_counts.entry(f.env_name.as_str()).or_default() += 1;
        }

        let mut env_names: Vec<&str> = by_env.keys().map(String::as_str).collect();
        for &name in failure_counts.keys() {
            if !env_names.contains(&name) {
                env_names.push(name);
            }
        }
        env_names.sort_unstable();

        let envs = env_names
            .into_iter()
            .map(|env| {
                let logs = by_env.get(env).map(Vec::as_slice).unwrap_or(&[]);
                EnvSummary::from_logs(env, logs, failure_counts.get(env).copied().unwrap_or(0))
            })
            .collect();

        // agent/client snapshots are identical across a run
        let first = by_env.values().flat_map(|logs| logs.first()).next();
        let agent = first
            .and_then(|l| l.agent.get("type"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let model = first
            .and_then(|l| l.client.get("model_id"))
            .and_then(|v| v.as_str())
            .map(String::from);

        Self {
            name: name.to_string(),
            agent,
            model,
            generated_at: Utc::now(),
            envs,
            failures: failures.to_vec(),
        }
    }

    pub fn total_episodes(&self) -> u32 {
        self.envs.iter().map(|e| e.episodes).sum()
    }
}

/// Rebuild the env → episode logs grouping from artifacts on disk
pub fn collect_from_dir(output_dir: &Path) -> Result<BTreeMap<String, Vec<EpisodeLog>>> {
    let mut paths: Vec<PathBuf> = WalkDir::new(output_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| is_episode_artifact(p))
        .collect();
    paths.sort();

    let mut by_env: BTreeMap<String, Vec<EpisodeLog>> = BTreeMap::new();
    for path in paths {
        let Some(env_name) = path
            .strip_prefix(output_dir)
            .ok()
            .and_then(|rel| rel.components().next())
            .and_then(|c| c.as_os_str().to_str())
        else {
            continue;
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match serde_json::from_str::<EpisodeLog>(&content) {
            Ok(log) => by_env.entry(env_name.to_string()).or_default().push(log),
            Err(e) => warn!("Skipping unreadable artifact {}: {}", path.display(), e),
        }
    }
    Ok(by_env)
}

/// `<task>_run_<digits>.json`
fn is_episode_artifact(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(".json"))
        .and_then(|stem| stem.rsplit_once("_run_"))
        .is_some_and(|(_, idx)| !idx.is_empty() && idx.chars().all(|c| c.is_ascii_digit()))
}

/// Export run summaries
pub struct ResultExporter {
    output_dir: PathBuf,
}

impl ResultExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Export summary to JSON
    pub fn export_json(&self, summary: &RunSummary) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;

        let path = self.output_dir.join("summary.json");
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(&path, json)?;

        info!("Exported JSON summary to {:?}", path);
        Ok(path)
    }

    /// Export summary to Markdown
    pub fn export_markdown(&self, summary: &RunSummary) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;

        let path = self.output_dir.join("summary.md");
        let mut md = String::new();

        md.push_str(&format!("# Evaluation Summary: {}\n\n", summary.name));
        if let Some(agent) = &summary.agent {
            md.push_str(&format!("- **Agent**: {}\n", agent));
        }
        if let Some(model) = &summary.model {
            md.push_str(&format!("- **Model**: {}\n", model));
        }
        md.push_str(&format!("- **Generated**: {}\n\n", summary.generated_at));

        md.push_str("## Environments\n\n");
        md.push_str("| Environment | Episodes | Failures | Done | Progression | Avg Return | Avg Steps | Tokens (in/out) |\n");
        md.push_str("|-------------|----------|----------|------|-------------|------------|-----------|-----------------|\n");
        for env in &summary.envs {
            md.push_str(&format!(
                "| {} | {} | {} | {} | {} | {:.4} | {:.1} | {}/{} |\n",
                env.env_name,
                env.episodes,
                env.failures,
                env.done,
                format_progression(env),
                env.average_return,
                env.average_steps,
                env.total_input_tokens,
                env.total_output_tokens
            ));
        }

        if !summary.failures.is_empty() {
            md.push_str("\n## Failures\n\n");
            md.push_str("| Environment | Task | Episode | Error |\n");
            md.push_str("|-------------|------|---------|-------|\n");
            for f in &summary.failures {
                md.push_str(&format!(
                    "| {} | {} | {} | {} |\n",
                    f.env_name,
                    f.task,
                    f.episode_idx,
                    f.error.replace('|', "\\|").replace('\n', " ")
                ));
            }
        }

        std::fs::write(&path, md)?;

        info!("Exported Markdown summary to {:?}", path);
        Ok(path)
    }

    /// Export all formats
    pub fn export_all(&self, summary: &RunSummary) -> Result<Vec<PathBuf>> {
        Ok(vec![
            self.export_json(summary)?,
            self.export_markdown(summary)?,
        ])
    }
}

fn format_progression(env: &EnvSummary) -> String {
    match (env.progression_mean, env.progression_std) {
        (Some(mean), Some(std)) => format!("{:.1}% ± {:.1}", mean * 100.0, std * 100.0),
        _ => "-".to_string(),
    }
}

/// Print summary to console
pub fn print_summary(summary: &RunSummary) {
    println!("\n{}", "=".repeat(72));
    println!("EVALUATION SUMMARY: {}", summary.name);
    println!("{}", "=".repeat(72));

    if let Some(agent) = &summary.agent {
        println!("\nAgent: {}", agent);
    }
    if let Some(model) = &summary.model {
        println!("Model: {}", model);
    }

    println!(
        "\n{:<16} {:>8} {:>8} {:>6} {:>16} {:>10} {:>9}",
        "Environment", "Episodes", "Failures", "Done", "Progression", "Return", "Steps"
    );
    println!("{}", "-".repeat(72));
    for env in &summary.envs {
        println!(
            "{:<16} {:>8} {:>8} {:>6} {:>16} {:>10.3} {:>9.1}",
            truncate(&env.env_name, 16),
            env.episodes,
            env.failures,
            env.done,
            format_progression(env),
            env.average_return,
            env.average_steps
        );
    }

    println!("{}", "=".repeat(72));
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
