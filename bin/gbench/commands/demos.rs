//! `gbench demos`: show which recorded demonstrations a task would draw from

use anyhow::{Context, Result};
use game_bench::{dataset::check_seed, dataset::load_demo, EvalConfig, InContextDataset};
use std::path::Path;

use crate::style::{print_header, print_key_value, print_warning, style_bold, style_dim};

pub fn run(config_path: &Path, overrides: &[String], env: &str, task: Option<&str>) -> Result<()> {
    let config = EvalConfig::load(config_path, overrides)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    let original_cwd = std::env::current_dir().context("Failed to read working directory")?;
    let dataset = InContextDataset::new(&config, env, &original_cwd)?;

    let tasks: Vec<String> = match task {
        Some(t) => vec![t.to_string()],
        None => config.tasks_for(env).to_vec(),
    };
    if tasks.is_empty() {
        print_warning(&format!("No tasks configured for {} (set tasks.{}_tasks)", env, env));
        return Ok(());
    }

    print_header(&format!("Demonstrations: {}", env));
    for task in tasks {
        let demos = dataset.enumerate_demo_episodes(&task)?;
        println!("  {}", style_bold(&task));
        print_key_value("Directory", &dataset.demo_dir(&task).display().to_string());
        print_key_value("Episodes", &demos.len().to_string());

        for path in &demos {
            let seed = check_seed(path)
                .map(|s| s.to_string())
                .unwrap_or_else(|_| "?".to_string());
            let steps = load_demo(path)
                .map(|d| d.actions.len().to_string())
                .unwrap_or_else(|e| format!("unreadable: {}", e));
            println!(
                "    {} {}",
                path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
                style_dim(&format!("seed={} steps={}", seed, steps))
            );
        }
        println!();
    }
    Ok(())
}
