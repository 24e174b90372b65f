// Error types shared by every startup phase of the harness

use crate::validation::ValidationError;
use std::path::PathBuf;
use thiserror::Error;

/// A flag declaration or value could not be bound.
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("duplicate flag declaration: '{0}'")]
    DuplicateFlag(String),

    #[error("flags '{first}' and '{second}' both map to environment variable {env_key}")]
    EnvKeyCollision {
        first: String,
        second: String,
        env_key: String,
    },

    #[error("invalid flag name: '{0}' (expected [A-Za-z0-9_-] starting with a letter or digit, not help/version)")]
    InvalidName(String),

    // Messages never carry the raw value, only what was wrong with it.
    #[error("invalid configuration values: {}", format_invalid(.0))]
    InvalidValues(Vec<InvalidValue>),

    #[error(transparent)]
    Cli(#[from] clap::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidValue {
    pub field: String,
    pub message: String,
}

fn format_invalid(values: &[InvalidValue]) -> String {
    values
        .iter()
        .map(|v| format!("{}: {}", v.field, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Every way the harness can fail, from flag parsing to the service's own run routine.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to bind configuration: {0}")]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown log_encoding: '{0}' must be json or console")]
    UnsupportedEncoding(String),

    #[error("invalid log_level: '{0}'")]
    InvalidLevel(String),

    #[error("failed to load TLS material from {path:?}: {reason}")]
    TlsLoad { path: PathBuf, reason: String },

    #[error("failed to listen on {address}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0:#}")]
    Run(anyhow::Error),
}

impl HarnessError {
    pub(crate) fn tls(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        HarnessError::TlsLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
