//! Error types shared across the harness.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by LLM provider clients.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Any failure of a single provider call. Every provider error lands here,
    /// rate limits and malformed requests alike, and all of them are retried.
    #[error("provider call failed: {0}")]
    Transient(String),

    #[error("failed to execute {operation} after {retries} retries: {last_error}")]
    ExhaustedRetries {
        operation: String,
        retries: u32,
        last_error: String,
    },

    #[error("missing API key: set client.api_key or {env_var}")]
    MissingApiKey { env_var: &'static str },

    #[error("{0} is not supported by this client")]
    Unsupported(&'static str),

    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transient(err.to_string())
    }
}

/// Errors raised while locating or loading recorded demonstrations.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("no demonstration episodes found under {0}")]
    NoDemos(PathBuf),

    #[error("demo filename has no seed_<int> component: {0}")]
    MissingSeed(PathBuf),

    #[error("corrupt demonstration {path}: {reason}")]
    CorruptDemo { path: PathBuf, reason: String },

    #[error("failed to read demonstration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by environment adapters.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("unknown environment family: {0}")]
    UnknownFamily(String),

    #[error("environment server error: {0}")]
    Server(String),

    #[error("environment protocol error: {0}")]
    Protocol(String),

    #[error("environment server timed out after {0}s")]
    Timeout(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading the run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid override {0:?}: expected key=value")]
    InvalidOverride(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
