//! In-context demonstration dataset
//!
//! Recorded episodes live under
//! `<original_cwd>/<eval.icl_dataset>/<env_name>/<task>/`, searched
//! recursively for `*.json` and `*.json.gz` files. The episode seed is
//! encoded in the file name as `...seed_<int>...`.

use flate2::read::GzDecoder;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::EvalConfig;
use crate::env::EnvFamily;
use crate::error::{DatasetError, EnvError};

/// NetHack role abbreviations used in demo file names
pub const NLE_ROLES: [&str; 13] = [
    "arc", "bar", "cav", "hea", "kni", "mon", "pri", "ran", "rog", "sam", "tou", "val", "wiz",
];

/// A recorded episode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedDemo {
    #[serde(alias = "action")]
    pub actions: Vec<Value>,
    #[serde(alias = "reward")]
    pub rewards: Vec<f64>,
    #[serde(default)]
    pub terminated: Vec<bool>,
    #[serde(default)]
    pub truncated: Vec<bool>,
    #[serde(default)]
    pub observations: Vec<Value>,
}

impl RecordedDemo {
    /// Actions with `null` and `""` mapped to `None`
    pub fn actions(&self) -> Vec<Option<Value>> {
        self.actions
            .iter()
            .map(|action| match action {
                Value::Null => None,
                Value::String(s) if s.is_empty() => None,
                other => Some(other.clone()),
            })
            .collect()
    }
}

/// One segment of a natural sort key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPart {
    /// Digit run without leading zeros
    Num(String),
    /// Lowercased non-digit run
    Text(String),
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyPart::Num(a), KeyPart::Num(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (KeyPart::Text(a), KeyPart::Text(b)) => a.cmp(b),
            (KeyPart::Num(_), KeyPart::Text(_)) => Ordering::Less,
            (KeyPart::Text(_), KeyPart::Num(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Split into alternating text and number runs so that "ep2" < "ep10".
/// The key always starts and ends with a text run.
pub fn natural_sort_key(s: &str) -> Vec<KeyPart> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut chars = s.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            let mut digits = String::new();
            while let Some(&d) = chars.peek() {
                if !d.is_ascii_digit() {
                    break;
                }
                digits.push(d);
                chars.next();
            }
            parts.push(KeyPart::Text(std::mem::take(&mut text).to_lowercase()));
            parts.push(KeyPart::Num(digits.trim_start_matches('0').to_string()));
        } else {
            text.push(c);
            chars.next();
        }
    }
    parts.push(KeyPart::Text(text.to_lowercase()));
    parts
}

fn strip_demo_extension(name: &str) -> Option<&str> {
    name.strip_suffix(".json.gz")
        .or_else(|| name.strip_suffix(".json"))
}

/// Seed encoded in the demo file name: the integer after the last `seed_`
pub fn check_seed(path: &Path) -> Result<u64, DatasetError> {
    let missing = || DatasetError::MissingSeed(path.to_path_buf());
    let name = path.file_name().and_then(|n| n.to_str()).ok_or_else(missing)?;
    let stem = strip_demo_extension(name).unwrap_or(name);
    let (_, rest) = stem.rsplit_once("seed_").ok_or_else(missing)?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().map_err(|_| missing())
}

pub fn load_demo(path: &Path) -> Result<RecordedDemo, DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    };
    let bytes = std::fs::read(path).map_err(io_err)?;

    let is_gz = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".gz"));
    let content = if is_gz {
        let mut decoded = String::new();
        GzDecoder::new(bytes.as_slice())
            .read_to_string(&mut decoded)
            .map_err(|e| DatasetError::CorruptDemo {
                path: path.to_path_buf(),
                reason: format!("gzip: {}", e),
            })?;
        decoded
    } else {
        String::from_utf8(bytes).map_err(|e| DatasetError::CorruptDemo {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    };

    serde_json::from_str(&content).map_err(|e| DatasetError::CorruptDemo {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

pub fn load_actions(path: &Path) -> Result<Vec<Option<Value>>, DatasetError> {
    Ok(load_demo(path)?.actions())
}

pub fn load_rewards(path: &Path) -> Result<Vec<f64>, DatasetError> {
    Ok(load_demo(path)?.rewards)
}

/// Demonstrations for one environment
#[derive(Debug, Clone)]
pub struct InContextDataset {
    env_name: String,
    family: EnvFamily,
    demo_root: PathBuf,
    tasks: Vec<String>,
}

impl InContextDataset {
    pub fn new(config: &EvalConfig, env_name: &str, original_cwd: &Path) -> Result<Self, EnvError> {
        Ok(Self {
            env_name: env_name.to_string(),
            family: env_name.parse()?,
            demo_root: original_cwd.join(&config.eval.icl_dataset).join(env_name),
            tasks: config.tasks_for(env_name).to_vec(),
        })
    }

    pub fn demo_dir(&self, task: &str) -> PathBuf {
        self.demo_root.join(task)
    }

    /// Every demo file for the task, in natural order of the full path
    pub fn enumerate_demo_episodes(&self, task: &str) -> Result<Vec<PathBuf>, DatasetError> {
        let dir = self.demo_dir(task);
        if !dir.is_dir() {
            return Ok(vec![]);
        }

        let mut demos = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(true) {
            let entry = entry.map_err(|e| DatasetError::Io {
                path: dir.clone(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let is_demo = entry
                .file_name()
                .to_str()
                .and_then(strip_demo_extension)
                .is_some();
            if is_demo {
                demos.push(entry.into_path());
            }
        }

        demos.sort_by_cached_key(|p| natural_sort_key(&p.to_string_lossy()));
        debug!("Found {} demos under {}", demos.len(), dir.display());
        Ok(demos)
    }

    /// For `babaisai`, a different task so the solution is not in context
    pub fn pick_demo_task(&self, task: &str, rng: &mut impl Rng) -> String {
        if self.family != EnvFamily::BabaIsAi {
            return task.to_string();
        }
        let others: Vec<&String> = self.tasks.iter().filter(|t| t.as_str() != task).collect();
        match others.choose(rng) {
            Some(other) => other.to_string(),
            None => {
                warn!(
                    "Only one {} task configured; demonstrating on {} itself",
                    self.env_name, task
                );
                task.to_string()
            }
        }
    }

    pub fn pick_demo_path(
        &self,
        i: usize,
        task: &str,
        config: &EvalConfig,
        live_seed: u64,
        rng: &mut impl Rng,
    ) -> Result<PathBuf, DatasetError> {
        let demos = self.enumerate_demo_episodes(task)?;
        if demos.is_empty() {
            return Err(DatasetError::NoDemos(self.demo_dir(task)));
        }
        let mut demo_path = demos[i % demos.len()].clone();

        match self.family {
            EnvFamily::Nle => {
                let character = &config.envs.nle_kwargs.character;
                if character != "@" {
                    for part in character.split('-') {
                        let role = part.to_lowercase();
                        if !NLE_ROLES.contains(&role.as_str()) {
                            continue;
                        }
                        let same_role: Vec<&PathBuf> = demos
                            .iter()
                            .filter(|p| demo_stem(p).to_lowercase().contains(&role))
                            .collect();
                        if let Some(choice) = same_role.choose(rng) {
                            demo_path = (*choice).clone();
                        }
                    }
                }
            }
            EnvFamily::TextWorld => {
                if check_seed(&demo_path)? == live_seed {
                    demo_path = demos[(i + 1) % demos.len()].clone();
                }
            }
            _ => {}
        }

        Ok(demo_path)
    }

    /// Copy of `config` set up to replay the demo at `demo_path`
    pub fn override_incontext_config(
        &self,
        config: &EvalConfig,
        demo_path: &Path,
    ) -> Result<EvalConfig, DatasetError> {
        let mut demo_config = config.clone();
        demo_config.envs.env_kwargs.seed = Some(check_seed(demo_path)?);
        match self.family {
            EnvFamily::Nle => {
                demo_config.envs.nle_kwargs.skip_more = true;
                demo_config.envs.nle_kwargs.character = "@".to_string();
            }
            EnvFamily::MiniHack => {
                demo_config.envs.minihack_kwargs.skip_more = true;
            }
            _ => {}
        }
        Ok(demo_config)
    }
}

fn demo_stem(path: &Path) -> &str {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| strip_demo_extension(n).unwrap_or(n))
        .unwrap_or_default()
}
