//! `gbench run`: evaluate the configured agent on every configured environment

use anyhow::{Context, Result};
use chrono::Local;
use game_bench::{
    collect_from_dir, results::print_summary, ConfiguredAgentFactory, EvalConfig,
    EvaluatorManager, ExternalEnvFactory, ResultExporter, RunSummary,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::style::{print_header, print_info, print_key_value, print_success, print_warning};

pub struct RunArgs {
    pub config: PathBuf,
    pub overrides: Vec<String>,
    pub output_dir: Option<PathBuf>,
    pub resume_from: Option<PathBuf>,
    pub workers: Option<usize>,
}

/// `<output_dir>/<timestamp>_<agent>_<model with / replaced>`
pub fn run_dir_name(config: &EvalConfig, timestamp: &str) -> String {
    format!(
        "{}_{}_{}",
        timestamp,
        config.agent.kind,
        config.client.model_id.replace('/', "_")
    )
}

pub async fn run(args: RunArgs) -> Result<()> {
    let mut config = EvalConfig::load(&args.config, &args.overrides)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    if let Some(dir) = args.output_dir {
        config.eval.output_dir = dir;
    }
    if let Some(dir) = args.resume_from {
        config.eval.resume_from = Some(dir);
    }
    if let Some(workers) = args.workers {
        config.eval.num_workers = workers;
    }

    let output_dir = match &config.eval.resume_from {
        Some(dir) => {
            if !dir.is_dir() {
                anyhow::bail!("Resume directory {} does not exist", dir.display());
            }
            dir.clone()
        }
        None => {
            let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
            config.eval.output_dir.join(run_dir_name(&config, &stamp))
        }
    };
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    save_config_snapshot(&output_dir, &config)?;

    print_header("Game Benchmark");
    print_key_value("Environments", &config.envs.names);
    print_key_value("Agent", config.agent.kind.as_str());
    print_key_value("Model", &config.client.model_id);
    print_key_value("Workers", &config.eval.num_workers.to_string());
    print_key_value("Output", &output_dir.display().to_string());
    println!();

    let original_cwd = std::env::current_dir().context("Failed to read working directory")?;
    let manager = EvaluatorManager::new(
        config.clone(),
        Arc::new(ExternalEnvFactory),
        &original_cwd,
        &output_dir,
    )?;
    if !manager.skipped().is_empty() {
        print_info(&format!(
            "Resuming: {} episodes already complete",
            manager.skipped().len()
        ));
    }

    let results = manager
        .run(Arc::new(ConfiguredAgentFactory::new(config)))
        .await?;
    info!(
        "Dispatched {} episodes, peak in flight {}",
        results.dispatch.dispatched, results.dispatch.peak_in_flight
    );

    for failure in &results.failures {
        print_warning(&format!(
            "{} {} #{} failed: {}",
            failure.env_name, failure.task, failure.episode_idx, failure.error
        ));
    }

    // Include episodes finished by earlier attempts at this directory
    let by_env = collect_from_dir(&output_dir)?;
    let summary = RunSummary::new(&dir_label(&output_dir), &by_env, &results.failures);
    let written = ResultExporter::new(&output_dir).export_all(&summary)?;
    print_summary(&summary);

    for path in written {
        print_success(&format!("Wrote {}", path.display()));
    }
    Ok(())
}

fn save_config_snapshot(output_dir: &Path, config: &EvalConfig) -> Result<()> {
    let path = output_dir.join("config.yaml");
    let content = serde_yaml::to_string(config).context("Failed to serialize config")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn dir_label(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}
