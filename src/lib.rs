pub mod config;
pub mod debounce;
pub mod devserver;
pub mod errors;
pub mod files;
pub mod guard;
pub mod install;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod reconcile;
pub mod reverse_sync;
pub mod sandbox;
pub mod store;
pub mod terminal;

pub use config::DevenvConfig;
pub use errors::{ManifestError, OrchestratorError, SandboxError};
pub use files::FileMap;
pub use orchestrator::{LifecycleState, Orchestrator, OrchestratorState, SyncMode, SyncOutcome};
