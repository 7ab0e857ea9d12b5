//! Typed error hierarchy for the devenv orchestrator.
//!
//! Three top-level enums cover the three failure surfaces:
//! - `SandboxError` - failures reported by the sandbox runtime capability
//! - `ManifestError` - `package.json` parse failures
//! - `OrchestratorError` - lifecycle failures surfaced to the UI

use thiserror::Error;

/// Errors reported by a sandbox runtime or one of its handles.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to boot sandbox: {0}")]
    Boot(String),

    #[error("Sandbox is already booted")]
    AlreadyBooted,

    #[error("No such file or directory: {path}")]
    NotFound { path: String },

    #[error("Filesystem operation on {path} failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("Failed to watch sandbox filesystem: {0}")]
    Watch(String),

    #[error("Sandbox has been torn down")]
    TornDown,
}

impl SandboxError {
    /// Wrap an I/O error with the sandbox path it occurred on.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound { path };
        }
        Self::Io { path, source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors from reading the project manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("package.json is not valid JSON: {source}")]
    Parse {
        #[source]
        source: serde_json::Error,
    },

    #[error("package.json must contain a JSON object")]
    NotAnObject,
}

/// Errors surfaced by the orchestrator state machine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Sandbox boot failed: {0}")]
    Boot(#[source] SandboxError),

    #[error("Failed to mount project: {0}")]
    Mount(#[source] SandboxError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("External store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Orchestrator has been stopped")]
    Stopped,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
