//! Error types shared by the runtime backends, the orchestrator and the HTTP layer.

use std::time::Duration;

use thiserror::Error;

use crate::runtime::CommandOutput;

/// Failures of the container runtime itself, never of the user's command.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create environment: {0}")]
    Create(String),
    #[error("failed to destroy environment {id}: {message}")]
    Destroy { id: String, message: String },
    #[error("environment {0} is gone")]
    EnvironmentGone(String),
    #[error("runtime i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Orchestrator-level failures. User command failures and failed `cd`
/// attempts are not errors; they come back as ordinary results.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("command exceeded {limit:?}")]
    Timeout {
        limit: Duration,
        output: CommandOutput,
    },
    #[error("all {0} session slots are being provisioned")]
    AtCapacity(usize),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to expand variables in `{path}`: {message}")]
    Expand { path: String, message: String },
    #[error("failed to parse config `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}
