//! Supervisor errors.

use pubwatch::PersistenceError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisionError {
    #[error("pipeline command is empty")]
    EmptyCommand,

    #[error("failed to spawn pipeline: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to stop pipeline (pid {pid}): {reason}")]
    Stop { pid: u32, reason: String },

    #[error("pipeline is not running")]
    NotRunning,

    #[error("liveness probe failed: {0}")]
    Probe(String),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("git {command} timed out after {timeout:?}")]
    GitTimeout { command: String, timeout: Duration },

    #[error("failed to run git: {0}")]
    GitIo(#[source] std::io::Error),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub type Result<T, E = SupervisionError> = std::result::Result<T, E>;
