//! gbench - evaluate LLM agents on game environments

mod commands;
mod style;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use style::print_error;

#[derive(Parser)]
#[command(name = "gbench")]
#[command(about = "Evaluate LLM agents on text and vision game environments")]
#[command(version)]
struct Cli {
    /// Increase log verbosity
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an evaluation
    Run {
        /// Configuration file (YAML or TOML)
        #[arg(short, long, default_value = "configs/eval.yaml", env = "GBENCH_CONFIG")]
        config: PathBuf,

        /// Dotted config override, e.g. `eval.num_workers=4`
        #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,

        /// Root directory for run outputs
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Continue a previous run directory
        #[arg(long)]
        resume_from: Option<PathBuf>,

        /// Number of concurrent workers
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// List the demonstrations available for an environment task
    Demos {
        #[arg(short, long, default_value = "configs/eval.yaml", env = "GBENCH_CONFIG")]
        config: PathBuf,

        #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,

        /// Environment name
        #[arg(short, long)]
        env: String,

        /// Task name (defaults to every configured task)
        #[arg(short, long)]
        task: Option<String>,
    },

    /// Summarize the episode logs of a finished run
    Summarize {
        /// Run directory
        dir: PathBuf,

        /// Skip writing summary.json/summary.md
        #[arg(long)]
        no_export: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "game_bench=debug"
    } else {
        "game_bench=info"
    };
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(d) = directive.parse() {
        filter = filter.add_directive(d);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = match cli.command {
        Commands::Run {
            config,
            overrides,
            output_dir,
            resume_from,
            workers,
        } => {
            commands::run::run(commands::run::RunArgs {
                config,
                overrides,
                output_dir,
                resume_from,
                workers,
            })
            .await
        }
        Commands::Demos {
            config,
            overrides,
            env,
            task,
        } => commands::demos::run(&config, &overrides, &env, task.as_deref()),
        Commands::Summarize { dir, no_export } => commands::summarize::run(&dir, !no_export),
    };

    if let Err(e) = result {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
