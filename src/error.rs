//! Error taxonomy for the provisioning flow

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by setup, deployment and teardown operations.
///
/// Pull failures are deliberately absent: they are logged as warnings and
/// never stop a deployment.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Container runtime missing or unreachable. Raised before any mutation.
    #[error("environment check failed: {0}")]
    Environment(String),

    /// A config directory or file could not be created or written.
    #[error("failed to write '{}': {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An artifact could not be serialized.
    #[error("failed to render {artifact}: {reason}")]
    Render { artifact: String, reason: String },

    /// The shared network could not be listed or created.
    #[error("network '{name}' could not be provisioned: {reason}")]
    Network { name: String, reason: String },

    /// Starting (or stopping) a compose manifest failed.
    #[error("deployment of '{}' failed: {reason}", manifest.display())]
    Deployment { manifest: PathBuf, reason: String },

    /// Invalid configuration file or value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Teardown record could not be read or written.
    #[error("teardown record error at '{}': {reason}", path.display())]
    Record { path: PathBuf, reason: String },

    /// Reading operator input failed.
    #[error("failed to read input: {0}")]
    Prompt(#[source] std::io::Error),

    /// A subprocess could not be spawned at all.
    #[error("failed to run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl SetupError {
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SetupError::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub fn deployment(manifest: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SetupError::Deployment {
            manifest: manifest.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error should abort the whole setup rather than a single deployment.
    ///
    /// Only a failed `up`/`down` is confined to its deployment; the other
    /// deployments of a run are still attempted.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SetupError::Deployment { .. })
    }
}

pub type Result<T, E = SetupError> = std::result::Result<T, E>;
