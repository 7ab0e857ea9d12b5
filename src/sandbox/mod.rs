//! Sandbox runtime capability.
//!
//! The orchestrator never implements a sandbox itself; it drives one through
//! these traits. A runtime boots exactly one [`Sandbox`], which offers a
//! filesystem rooted at the project directory, process spawning, a recursive
//! watch stream and a `server-ready` notification channel.
//!
//! Implementations:
//! - [`memory::MemoryRuntime`] - in-memory filesystem with scripted processes,
//!   used as the test double throughout the crate.
//! - [`local::LocalRuntime`] - a host directory plus real child processes,
//!   used by the CLI.

pub mod local;
pub mod memory;
pub mod tree;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::errors::SandboxError;

pub use tree::{FileNode, FileTree, build_tree};

/// Boots and owns the single sandbox instance.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Create the sandbox. Fails with [`SandboxError::AlreadyBooted`] when an
    /// instance already exists.
    async fn boot(&self) -> Result<Arc<dyn Sandbox>, SandboxError>;

    /// The already-booted instance, if any.
    fn instance(&self) -> Option<Arc<dyn Sandbox>>;
}

/// A booted sandbox. All paths are project-relative with `/` separators.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Mount a whole tree at the project root.
    async fn mount(&self, tree: &FileTree) -> Result<(), SandboxError>;

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError>;

    /// Read a file. A missing file is [`SandboxError::NotFound`].
    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    /// Write a file. The parent directory must already exist.
    async fn write_file(&self, path: &str, contents: &str) -> Result<(), SandboxError>;

    /// Create a directory and any missing ancestors.
    async fn mkdir(&self, path: &str) -> Result<(), SandboxError>;

    async fn remove(&self, path: &str, recursive: bool) -> Result<(), SandboxError>;

    /// Recursively watch the project root. Each call returns a fresh stream.
    fn watch(&self) -> Result<mpsc::UnboundedReceiver<WatchEvent>, SandboxError>;

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<SandboxProcess, SandboxError>;

    /// Subscribe to `server-ready` notifications.
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;

    /// Release the sandbox. Further calls may fail with [`SandboxError::TornDown`].
    async fn teardown(&self);
}

/// Kill switch for a spawned process.
pub trait ProcessControl: Send + Sync {
    fn kill(&self);
}

/// A running sandbox process.
pub struct SandboxProcess {
    /// Identifier unique within the sandbox.
    pub id: u64,
    /// Combined stdout/stderr chunks. Closes when the process exits.
    pub output: mpsc::UnboundedReceiver<String>,
    /// Resolves with the exit code; `None` when the process ended without one.
    pub exit: oneshot::Receiver<Option<i32>>,
    pub control: Arc<dyn ProcessControl>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Working directory relative to the project root; `None` means the root.
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    Change,
    Rename,
}

/// A filesystem change observed inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchKind,
    /// Path as reported by the runtime; not necessarily normalized.
    pub path: String,
}

/// The runtime's announcement that a process is listening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}
