//! Error taxonomy for the monitoring pipeline.
//!
//! Transport and input errors are absorbed at their component boundary and
//! turned into feed state. Persistence errors abort the current cycle.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error for library callers that do not care which layer failed.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Input(#[from] ClassificationInputError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A feed fetch failed before any payload could be looked at.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream returned HTTP {status}")]
    Status { status: u16 },

    #[error("response body could not be read: {0}")]
    Body(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Body(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// The upstream answered, but the payload does not fit the publication schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed payload: {0}")]
pub struct ClassificationInputError(pub String);

/// State file I/O failed.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Configuration could not be loaded or is inconsistent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
