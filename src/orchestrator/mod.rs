//! Orchestrator state machine.
//!
//! Ties the sandbox runtime, the file reconciler, the install and dev-server
//! supervisors and the reverse-sync watcher into one lifecycle:
//!
//! ```text
//! idle -> booting -> mounting -> installing -> starting -> ready
//!                                                  ^          |
//!                                                  +-restart--+
//! ```
//!
//! Observers follow [`OrchestratorState`] through [`Orchestrator::subscribe`].
//! Every public operation converts failures into terminal lines and the
//! observable `error` field; none of them panics.
//!
//! Restart policy: a running dev server is restarted only after a
//! dependency install or on [`Orchestrator::restart_dev_server`]. Plain file
//! edits are written into the sandbox and left to the server's own reloader.

pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::DevenvConfig;
use crate::devserver::{DevServerOptions, DevServerSupervisor, StartOutcome};
use crate::errors::{OrchestratorError, SandboxError};
use crate::files::{FileMap, IgnoreFilter, MANIFEST};
use crate::install::{InstallOutcome, InstallSupervisor};
use crate::manifest::{self, DependencyDecision};
use crate::reconcile::{MountedFiles, ReconcileOutcome, ReconcileReport, Reconciler};
use crate::reverse_sync::{ReverseSync, ReverseSyncOptions};
use crate::sandbox::{Sandbox, SandboxRuntime};
use crate::store::FileStore;
use crate::terminal::Terminal;

pub use state::{LifecycleState, OrchestratorState, StateHandle};

/// Whether the desired file set is final or still being streamed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Content may be incomplete; record it but do not reconcile.
    Streaming,
    /// Content is complete; reconcile now.
    Settled,
}

/// What one settled sync did.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub reconcile: ReconcileReport,
    pub dependencies: DependencyDecision,
    /// `None` when no install was needed.
    pub install: Option<InstallOutcome>,
    /// `None` when the dev server was left alone.
    pub start: Option<StartOutcome>,
}

#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// Streaming input was recorded for a later settled sync.
    Deferred,
    /// A reconciliation pass was already running; nothing was done.
    Busy,
    Applied(SyncReport),
}

struct Inner {
    session_id: Uuid,
    span: tracing::Span,
    config: DevenvConfig,
    runtime: Arc<dyn SandboxRuntime>,
    store: Arc<dyn FileStore>,
    terminal: Terminal,
    state: StateHandle,
    reconciler: Reconciler,
    install: InstallSupervisor,
    devserver: DevServerSupervisor,
    sandbox: tokio::sync::Mutex<Option<Arc<dyn Sandbox>>>,
    reverse_sync: Mutex<Option<Arc<ReverseSync>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    deferred: Mutex<Option<FileMap>>,
    /// Set once an install has succeeded for the mounted project.
    installed: AtomicBool,
    /// Dependencies changed while an install was running.
    install_stale: AtomicBool,
    stopped: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The development-environment orchestrator. Cheap to clone; clones share
/// one sandbox.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: DevenvConfig,
        runtime: Arc<dyn SandboxRuntime>,
        store: Arc<dyn FileStore>,
        terminal: Terminal,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let state = StateHandle::new();
        let ignore = IgnoreFilter::new(&config.sync.ignore);
        let reconciler = Reconciler::new(
            MountedFiles::new(),
            ignore,
            config.devserver.stripped_flags.clone(),
        );
        let install = InstallSupervisor::new(
            config.sandbox.package_manager.clone(),
            config.sandbox.install_args.clone(),
            config.sandbox.env.clone(),
            terminal.clone(),
        );
        let devserver = DevServerSupervisor::new(
            DevServerOptions::from_config(&config),
            terminal.clone(),
            state.clone(),
        );

        Self {
            inner: Arc::new(Inner {
                session_id,
                span: tracing::info_span!("devenv", session = %session_id),
                config,
                runtime,
                store,
                terminal,
                state,
                reconciler,
                install,
                devserver,
                sandbox: tokio::sync::Mutex::new(None),
                reverse_sync: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                deferred: Mutex::new(None),
                installed: AtomicBool::new(false),
                install_stale: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn config(&self) -> &DevenvConfig {
        &self.inner.config
    }

    pub fn terminal(&self) -> &Terminal {
        &self.inner.terminal
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<OrchestratorState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> OrchestratorState {
        self.inner.state.snapshot()
    }

    /// The orchestrator's record of what is mounted in the sandbox.
    pub fn mounted_files(&self) -> FileMap {
        self.inner.reconciler.mounted().snapshot()
    }

    pub fn is_installing(&self) -> bool {
        self.inner.install.is_installing()
    }

    fn ensure_running(&self) -> Result<(), OrchestratorError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(OrchestratorError::Stopped);
        }
        Ok(())
    }

    /// Boot the sandbox, or return the one already booted.
    pub async fn boot(&self) -> Result<Arc<dyn Sandbox>, OrchestratorError> {
        self.boot_inner()
            .instrument(self.inner.span.clone())
            .await
    }

    async fn boot_inner(&self) -> Result<Arc<dyn Sandbox>, OrchestratorError> {
        self.ensure_running()?;
        let inner = &self.inner;
        let mut slot = inner.sandbox.lock().await;
        if let Some(sandbox) = slot.as_ref() {
            return Ok(Arc::clone(sandbox));
        }

        inner.state.update(|s| {
            s.lifecycle = LifecycleState::Booting;
            s.error = None;
        });
        inner.terminal.info("Booting sandbox...");
        tracing::info!("booting sandbox");

        let sandbox = match inner.runtime.boot().await {
            Ok(sandbox) => sandbox,
            Err(SandboxError::AlreadyBooted) => match inner.runtime.instance() {
                Some(sandbox) => {
                    tracing::info!("sandbox already booted, reattaching");
                    sandbox
                }
                None => return Err(self.boot_failed(SandboxError::AlreadyBooted)),
            },
            Err(e) => return Err(self.boot_failed(e)),
        };

        let mut tasks = vec![inner.devserver.spawn_ready_listener(sandbox.as_ref())];
        if !inner.terminal.is_attached() {
            tasks.push(inner.terminal.spawn_flusher(inner.config.flush_interval()));
        }
        lock(&inner.tasks).extend(tasks);

        let options = ReverseSyncOptions {
            debounce: inner.config.debounce(),
            ignore: IgnoreFilter::new(&inner.config.sync.ignore),
            placeholder: inner.config.sync.placeholder.clone(),
            stripped_flags: inner.config.devserver.stripped_flags.clone(),
        };
        match ReverseSync::start(
            Arc::clone(&sandbox),
            Arc::clone(&inner.store),
            inner.reconciler.mounted().clone(),
            inner.reconciler.mounting().clone(),
            options,
        ) {
            Ok(watcher) => *lock(&inner.reverse_sync) = Some(Arc::new(watcher)),
            Err(e) => {
                tracing::warn!(error = %e, "reverse sync unavailable");
                inner
                    .terminal
                    .warn(&format!("Sandbox changes will not be saved: {}", e));
            }
        }

        inner.state.set_lifecycle(LifecycleState::Mounting);
        inner.terminal.info("Sandbox booted");
        *slot = Some(Arc::clone(&sandbox));
        Ok(sandbox)
    }

    fn boot_failed(&self, error: SandboxError) -> OrchestratorError {
        let message = error.to_string();
        tracing::error!(error = %message, "sandbox boot failed");
        self.inner.terminal.error(&message);
        self.inner.state.fail(message);
        OrchestratorError::Boot(error)
    }

    /// Bring the sandbox in line with `desired` and drive install and start.
    pub async fn sync(
        &self,
        desired: FileMap,
        mode: SyncMode,
    ) -> Result<SyncOutcome, OrchestratorError> {
        self.sync_inner(desired, mode)
            .instrument(self.inner.span.clone())
            .await
    }

    /// Reconcile the last input recorded during streaming, if any.
    pub async fn settle(&self) -> Result<SyncOutcome, OrchestratorError> {
        let deferred = lock(&self.inner.deferred).take();
        match deferred {
            Some(desired) => self.sync(desired, SyncMode::Settled).await,
            None => Ok(SyncOutcome::Deferred),
        }
    }

    async fn sync_inner(
        &self,
        desired: FileMap,
        mode: SyncMode,
    ) -> Result<SyncOutcome, OrchestratorError> {
        self.ensure_running()?;
        let inner = &self.inner;
        if mode == SyncMode::Streaming {
            tracing::trace!(files = desired.len(), "deferring streamed input");
            *lock(&inner.deferred) = Some(desired);
            return Ok(SyncOutcome::Deferred);
        }
        lock(&inner.deferred).take();

        let sandbox = self.boot().await?;
        if !inner.reconciler.has_mounted() {
            inner.state.set_lifecycle(LifecycleState::Mounting);
            inner.terminal.info("Mounting project files...");
        }

        let report = match inner.reconciler.reconcile(sandbox.as_ref(), &desired).await {
            Ok(ReconcileOutcome::Applied(report)) => report,
            Ok(ReconcileOutcome::Busy) => return Ok(SyncOutcome::Busy),
            Err(e) => {
                let message = e.to_string();
                tracing::error!(error = %message, "mount failed");
                inner.terminal.error(&format!("Failed to mount project: {}", message));
                inner.state.fail(message);
                return Err(OrchestratorError::Mount(e));
            }
        };
        for failure in &report.failures {
            inner.terminal.warn(&format!(
                "Could not sync {}: {}",
                failure.path, failure.message
            ));
        }

        let current = inner.reconciler.mounted().get(MANIFEST);
        let dependencies = match manifest::dependencies_changed(
            report.previous_manifest.as_deref(),
            current.as_deref(),
            false,
        ) {
            Ok(decision) => decision,
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(error = %message, "manifest rejected");
                inner.terminal.error(&message);
                inner.state.fail(message);
                return Err(e.into());
            }
        };

        let mut sync = SyncReport {
            reconcile: report,
            dependencies,
            install: None,
            start: None,
        };

        let needs_install = current.is_some()
            && (dependencies.requires_install() || !inner.installed.load(Ordering::Acquire));
        if needs_install {
            let outcome = self.install(sandbox.as_ref(), dependencies).await;
            let proceed = outcome.success();
            sync.install = Some(outcome);
            if !proceed {
                return Ok(SyncOutcome::Applied(sync));
            }
        }

        let installed_now = sync.install.as_ref().is_some_and(InstallOutcome::success);
        if !inner.devserver.is_started() {
            sync.start = Some(inner.devserver.start(sandbox.as_ref()).await);
        } else if installed_now {
            sync.start = Some(inner.devserver.restart(sandbox.as_ref()).await);
        } else {
            self.settle_lifecycle();
        }
        Ok(SyncOutcome::Applied(sync))
    }

    /// Run the install, repeating it if dependencies changed meanwhile.
    async fn install(&self, sandbox: &dyn Sandbox, decision: DependencyDecision) -> InstallOutcome {
        let inner = &self.inner;
        if inner.install.is_installing() {
            if decision.requires_install() {
                inner.install_stale.store(true, Ordering::Release);
            }
            return InstallOutcome::AlreadyRunning;
        }

        let before = inner.state.lifecycle();
        inner.state.update(|s| {
            s.lifecycle = LifecycleState::Installing;
            s.error = None;
        });
        loop {
            inner.install_stale.store(false, Ordering::Release);
            let outcome = inner.install.run(sandbox).await;
            match &outcome {
                InstallOutcome::Succeeded => {
                    inner.installed.store(true, Ordering::Release);
                    if inner.install_stale.load(Ordering::Acquire) {
                        tracing::info!("dependencies changed during install, reinstalling");
                        continue;
                    }
                }
                InstallOutcome::AlreadyRunning => {
                    if decision.requires_install() {
                        inner.install_stale.store(true, Ordering::Release);
                    }
                }
                InstallOutcome::Failed { .. } | InstallOutcome::SpawnFailed(_) => {
                    inner.installed.store(false, Ordering::Release);
                    inner.devserver.mark_not_started();
                    let running = inner.devserver.current_id().is_some();
                    inner.state.update(|s| {
                        s.error = Some("Dependency install failed".to_string());
                        s.lifecycle = if running && before.is_booted() && !before.is_busy() {
                            before
                        } else {
                            LifecycleState::Stopped
                        };
                    });
                }
            }
            return outcome;
        }
    }

    /// Leave transitional states once nothing more is going to happen.
    fn settle_lifecycle(&self) {
        let devserver = &self.inner.devserver;
        self.inner.state.update(|s| {
            if !matches!(s.lifecycle, LifecycleState::Mounting | LifecycleState::Error) {
                return;
            }
            s.error = None;
            s.lifecycle = if devserver.current_id().is_none() {
                LifecycleState::Stopped
            } else if s.url.is_some() {
                LifecycleState::Ready
            } else {
                LifecycleState::Starting
            };
        });
    }

    /// Kill and relaunch the dev server.
    pub async fn restart_dev_server(&self) -> Result<StartOutcome, OrchestratorError> {
        let sandbox = self.boot().await?;
        Ok(self
            .inner
            .devserver
            .restart(sandbox.as_ref())
            .instrument(self.inner.span.clone())
            .await)
    }

    /// Manual override for a missed `server-ready` notification.
    pub fn force_ready(&self) -> bool {
        let forced = self.inner.devserver.force_ready();
        if !forced {
            tracing::debug!("force ready with no pending start");
        }
        forced
    }

    /// Push sandbox-side changes to the store without waiting for the
    /// debounce window.
    pub async fn flush_reverse_sync(&self) {
        let watcher = lock(&self.inner.reverse_sync).clone();
        if let Some(watcher) = watcher {
            watcher.flush_now().await;
        }
    }

    /// Tear everything down: kill both processes, stop watching and release
    /// the sandbox. Later operations fail with [`OrchestratorError::Stopped`].
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_inner()
            .instrument(self.inner.span.clone())
            .await
    }

    async fn stop_inner(&self) {
        let inner = &self.inner;
        tracing::info!("tearing down orchestrator");

        let watcher = lock(&inner.reverse_sync).take();
        if let Some(watcher) = watcher {
            watcher.stop();
        }
        inner.devserver.stop();
        inner.install.kill();
        let tasks: Vec<_> = lock(&inner.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }

        let sandbox = inner.sandbox.lock().await.take();
        if let Some(sandbox) = sandbox {
            sandbox.teardown().await;
        }
        inner.reconciler.reset();
        inner.state.update(|s| {
            s.lifecycle = LifecycleState::Idle;
            s.url = None;
            s.port = None;
            s.mobile_preview_url = None;
        });
        inner.terminal.info("Sandbox stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::memory::{MemoryRuntime, ProcessScript};
    use crate::store::MemoryStore;

    fn files(entries: &[(&str, &str)]) -> FileMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn orchestrator(runtime: &Arc<MemoryRuntime>) -> Orchestrator {
        Orchestrator::new(
            DevenvConfig::default(),
            runtime.clone(),
            Arc::new(MemoryStore::new(FileMap::new())),
            Terminal::new(),
        )
    }

    #[tokio::test]
    async fn test_boot_is_idempotent() {
        let runtime = Arc::new(MemoryRuntime::new());
        let orch = orchestrator(&runtime);
        orch.boot().await.unwrap();
        orch.boot().await.unwrap();
        assert_eq!(runtime.boot_count(), 1);
        assert_eq!(orch.state().lifecycle, LifecycleState::Mounting);
    }

    #[tokio::test]
    async fn test_already_booted_reattaches() {
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.preboot();
        let orch = orchestrator(&runtime);
        assert!(orch.boot().await.is_ok());
        assert_eq!(runtime.boot_count(), 0);
    }

    #[tokio::test]
    async fn test_boot_failure_is_error_state() {
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.fail_next_boot("no cross-origin isolation");
        let orch = orchestrator(&runtime);

        let err = orch.boot().await.err().expect("boot should fail");
        assert!(matches!(err, OrchestratorError::Boot(_)));
        let state = orch.state();
        assert_eq!(state.lifecycle, LifecycleState::Error);
        assert!(state.error.unwrap().contains("no cross-origin isolation"));

        // A later boot retries.
        assert!(orch.boot().await.is_ok());
    }

    #[tokio::test]
    async fn test_streaming_input_is_deferred() {
        let runtime = Arc::new(MemoryRuntime::new());
        let orch = orchestrator(&runtime);
        let outcome = orch
            .sync(files(&[("package.json", "{\"scripts\":")]), SyncMode::Streaming)
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Deferred));
        assert_eq!(runtime.boot_count(), 0);
        assert!(orch.mounted_files().is_empty());
    }

    #[tokio::test]
    async fn test_settle_reconciles_last_streamed_input() {
        let runtime = Arc::new(MemoryRuntime::new());
        let orch = orchestrator(&runtime);
        orch.sync(files(&[("a.js", "partial")]), SyncMode::Streaming)
            .await
            .unwrap();
        orch.sync(files(&[("a.js", "complete")]), SyncMode::Streaming)
            .await
            .unwrap();

        let outcome = orch.settle().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Applied(_)));
        assert_eq!(runtime.sandbox().file("a.js").as_deref(), Some("complete"));
    }

    #[tokio::test]
    async fn test_invalid_manifest_sets_error_state() {
        let runtime = Arc::new(MemoryRuntime::new());
        let orch = orchestrator(&runtime);
        let err = orch
            .sync(files(&[("package.json", "{ not json")]), SyncMode::Settled)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Manifest(_)));
        assert_eq!(orch.state().lifecycle, LifecycleState::Error);
        assert!(runtime.sandbox().spawned().is_empty());
    }

    #[tokio::test]
    async fn test_failed_install_blocks_start_and_retries() {
        let runtime = Arc::new(MemoryRuntime::new());
        let sandbox = runtime.sandbox();
        sandbox.script("npm install", ProcessScript::exits(1));
        let orch = orchestrator(&runtime);
        let manifest = r#"{"dependencies":{"left-pad":"1.0.0"},"scripts":{"dev":"vite"}}"#;

        let SyncOutcome::Applied(report) = orch
            .sync(files(&[("package.json", manifest)]), SyncMode::Settled)
            .await
            .unwrap()
        else {
            panic!("expected applied sync");
        };
        assert_eq!(report.install, Some(InstallOutcome::Failed { code: Some(1) }));
        assert!(report.start.is_none());
        assert_eq!(orch.state().lifecycle, LifecycleState::Stopped);

        // Same manifest again: the project was never installed, so retry.
        sandbox.script("npm install", ProcessScript::exits(0));
        let SyncOutcome::Applied(report) = orch
            .sync(files(&[("package.json", manifest)]), SyncMode::Settled)
            .await
            .unwrap()
        else {
            panic!("expected applied sync");
        };
        assert_eq!(report.install, Some(InstallOutcome::Succeeded));
        assert!(matches!(report.start, Some(StartOutcome::Started { .. })));
    }

    #[tokio::test]
    async fn test_project_without_manifest_starts_index() {
        let runtime = Arc::new(MemoryRuntime::new());
        let orch = orchestrator(&runtime);
        let SyncOutcome::Applied(report) = orch
            .sync(files(&[("index.js", "console.log(1)")]), SyncMode::Settled)
            .await
            .unwrap()
        else {
            panic!("expected applied sync");
        };
        assert!(report.install.is_none());
        assert_eq!(runtime.sandbox().spawned()[0].command_line(), "node index.js");
    }

    #[tokio::test]
    async fn test_operations_after_stop_fail() {
        let runtime = Arc::new(MemoryRuntime::new());
        let orch = orchestrator(&runtime);
        orch.boot().await.unwrap();
        orch.stop().await;
        assert_eq!(orch.state().lifecycle, LifecycleState::Idle);
        assert!(matches!(
            orch.sync(FileMap::new(), SyncMode::Settled).await,
            Err(OrchestratorError::Stopped)
        ));
        assert!(matches!(orch.boot().await, Err(OrchestratorError::Stopped)));
    }
}
