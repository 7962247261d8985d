//! Evaluation manager
//!
//! Enumerates `(env_name, task, episode_idx)` work items, skips the ones whose
//! JSON artifact already exists, and runs the rest either sequentially or on
//! a bounded pool of long-lived worker tasks.

use anyhow::Result;
use futures::FutureExt;
use indexmap::{IndexMap, IndexSet};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentFactory};
use crate::config::EvalConfig;
use crate::env::EnvFactory;
use crate::evaluator::{EpisodeLog, Evaluator};

/// Unit of resumability and dispatch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub env_name: String,
    pub task: String,
    pub episode_idx: usize,
}

/// A work item that errored or panicked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub env_name: String,
    pub task: String,
    pub episode_idx: usize,
    pub worker: Option<usize>,
    pub error: String,
    pub traceback: String,
}

#[derive(Debug)]
enum WorkerReport {
    Completed {
        env_name: String,
        worker: Option<usize>,
        log: Box<EpisodeLog>,
    },
    Failed(FailureRecord),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub dispatched: usize,
    pub completed: usize,
    /// Highest number of items handed to workers and not yet reported
    pub peak_in_flight: usize,
}

#[derive(Debug, Default)]
pub struct RunResults {
    /// Episode logs in completion order, grouped by environment
    pub by_env: BTreeMap<String, Vec<EpisodeLog>>,
    pub failures: Vec<FailureRecord>,
    pub dispatch: DispatchStats,
}

impl RunResults {
    fn record(&mut self, report: WorkerReport) {
        match report {
            WorkerReport::Completed {
                env_name,
                worker,
                log,
            } => {
                debug!(
                    "Worker {:?} finished {} {} (return {})",
                    worker, env_name, log.task, log.episode_return
                );
                self.by_env.entry(env_name).or_default().push(*log);
            }
            WorkerReport::Failed(failure) => {
                error!(
                    "Episode {}/{} #{} failed on worker {:?}: {}",
                    failure.env_name, failure.task, failure.episode_idx, failure.worker, failure.error
                );
                self.failures.push(failure);
            }
        }
    }
}

pub struct EvaluatorManager {
    config: EvalConfig,
    evaluators: Arc<IndexMap<String, Arc<Evaluator>>>,
    pending: Vec<WorkItem>,
    skipped: Vec<WorkItem>,
    output_dir: PathBuf,
}

impl EvaluatorManager {
    pub fn new(
        config: EvalConfig,
        env_factory: Arc<dyn EnvFactory>,
        original_cwd: &Path,
        output_dir: &Path,
    ) -> Result<Self> {
        let env_names: IndexSet<String> = config.env_names().into_iter().collect();

        let mut evaluators = IndexMap::new();
        let mut pending = Vec::new();
        let mut skipped = Vec::new();

        for env_name in env_names {
            let evaluator = Evaluator::new(
                &env_name,
                config.clone(),
                env_factory.clone(),
                original_cwd,
                output_dir,
            )?;

            let tasks: IndexSet<&String> = evaluator.tasks().iter().collect();
            for task in tasks {
                for episode_idx in 0..evaluator.num_episodes() {
                    let item = WorkItem {
                        env_name: env_name.clone(),
                        task: task.clone(),
                        episode_idx,
                    };
                    if evaluator.artifact_path(task, episode_idx, "json").exists() {
                        info!(
                            "Skipping completed episode: {} {} #{}",
                            env_name, task, episode_idx
                        );
                        skipped.push(item);
                    } else {
                        pending.push(item);
                    }
                }
            }
            evaluators.insert(env_name, Arc::new(evaluator));
        }

        info!(
            "{} episodes to run, {} already complete",
            pending.len(),
            skipped.len()
        );

        Ok(Self {
            config,
            evaluators: Arc::new(evaluators),
            pending,
            skipped,
            output_dir: output_dir.to_path_buf(),
        })
    }

    pub fn pending(&self) -> &[WorkItem] {
        &self.pending
    }

    pub fn skipped(&self) -> &[WorkItem] {
        &self.skipped
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub async fn run(&self, agent_factory: Arc<dyn AgentFactory>) -> Result<RunResults> {
        if self.config.eval.num_workers <= 1 {
            self.run_sequential(agent_factory).await
        } else {
            self.run_parallel(agent_factory, self.config.eval.num_workers)
                .await
        }
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.config.eval.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        ) {
            pb.set_style(style.progress_chars("=> "));
        }
        pb
    }

    /// One fresh agent per episode
    async fn run_sequential(&self, agent_factory: Arc<dyn AgentFactory>) -> Result<RunResults> {
        let mut results = RunResults::default();
        let pb = self.progress_bar(self.pending.len());

        for item in &self.pending {
            pb.set_message(format!("{} {}", item.env_name, item.task));
            results.dispatch.dispatched += 1;
            results.dispatch.peak_in_flight = 1;

            let report = match agent_factory.create_agent() {
                Ok(mut agent) => run_item(&self.evaluators, item, agent.as_mut(), None).await,
                Err(e) => failure(item, None, &e),
            };
            results.dispatch.completed += 1;
            results.record(report);
            pb.inc(1);
        }

        pb.finish_and_clear();
        Ok(results)
    }

    /// `workers` long-lived tasks, each owning one agent. At most `workers`
    /// items are in flight: the coordinator sends one new item per result.
    async fn run_parallel(
        &self,
        agent_factory: Arc<dyn AgentFactory>,
        workers: usize,
    ) -> Result<RunResults> {
        let mut results = RunResults::default();
        let total = self.pending.len();
        if total == 0 {
            return Ok(results);
        }

        let (work_tx, work_rx) = mpsc::unbounded_channel::<WorkItem>();
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<WorkerReport>();

        info!("Starting {} workers for {} episodes", workers, total);
        let handles: Vec<_> = (0..workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    self.evaluators.clone(),
                    agent_factory.clone(),
                    work_rx.clone(),
                    result_tx.clone(),
                ))
            })
            .collect();
        drop(result_tx);

        let pb = self.progress_bar(total);
        let mut queue = self.pending.iter().cloned();
        let mut in_flight = 0usize;

        for item in queue.by_ref().take(workers) {
            if work_tx.send(item).is_err() {
                break;
            }
            results.dispatch.dispatched += 1;
            in_flight += 1;
        }
        results.dispatch.peak_in_flight = in_flight;

        while results.dispatch.completed < total {
            let Some(report) = result_rx.recv().await else {
                error!(
                    "All workers exited with {} episodes outstanding",
                    total - results.dispatch.completed
                );
                break;
            };
            results.dispatch.completed += 1;
            in_flight -= 1;
            results.record(report);
            pb.inc(1);

            if let Some(item) = queue.next() {
                if work_tx.send(item).is_ok() {
                    results.dispatch.dispatched += 1;
                    in_flight += 1;
                    results.dispatch.peak_in_flight = results.dispatch.peak_in_flight.max(in_flight);
                }
            }
        }

        // closing the dispatch channel stops the workers
        drop(work_tx);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        pb.finish_and_clear();

        Ok(results)
    }
}

async fn worker_loop(
    worker_id: usize,
    evaluators: Arc<IndexMap<String, Arc<Evaluator>>>,
    agent_factory: Arc<dyn AgentFactory>,
    work_rx: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>,
    result_tx: mpsc::UnboundedSender<WorkerReport>,
) {
    let mut agent = agent_factory.create_agent();
    if let Err(e) = &agent {
        error!("Worker {} could not create its agent: {:#}", worker_id, e);
    }

    loop {
        let next = work_rx.lock().await.recv().await;
        let Some(item) = next else { break };
        debug!("Worker {} picked {:?}", worker_id, item);

        let report = match agent.as_mut() {
            Ok(agent) => run_item(&evaluators, &item, agent.as_mut(), Some(worker_id)).await,
            Err(e) => failure(&item, Some(worker_id), e),
        };
        if result_tx.send(report).is_err() {
            break;
        }
    }
    debug!("Worker {} exiting", worker_id);
}

async fn run_item(
    evaluators: &IndexMap<String, Arc<Evaluator>>,
    item: &WorkItem,
    agent: &mut dyn Agent,
    worker: Option<usize>,
) -> WorkerReport {
    let Some(evaluator) = evaluators.get(&item.env_name) else {
        return failure(
            item,
            worker,
            &anyhow::anyhow!("no evaluator for {}", item.env_name),
        );
    };

    let episode = evaluator.run_episode(&item.task, agent, item.episode_idx, worker);
    match AssertUnwindSafe(episode).catch_unwind().await {
        Ok(Ok(log)) => WorkerReport::Completed {
            env_name: item.env_name.clone(),
            worker,
            log: Box::new(log),
        },
        Ok(Err(e)) => failure(item, worker, &e),
        Err(panic) => WorkerReport::Failed(FailureRecord {
            env_name: item.env_name.clone(),
            task: item.task.clone(),
            episode_idx: item.episode_idx,
            worker,
            error: format!("panic: {}", panic_message(panic.as_ref())),
            traceback: String::new(),
        }),
    }
}

fn failure(item: &WorkItem, worker: Option<usize>, err: &anyhow::Error) -> WorkerReport {
    WorkerReport::Failed(FailureRecord {
        env_name: item.env_name.clone(),
        task: item.task.clone(),
        episode_idx: item.episode_idx,
        worker,
        error: format!("{:#}", err),
        traceback: format!("{:?}", err),
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
