//! Dev-server supervisor.
//!
//! Owns the single long-running dev-server process: picks the launch command,
//! kills and awaits any predecessor, streams output to the terminal, and turns
//! the runtime's `server-ready` notification (or a manual override) into the
//! `ready` lifecycle state.
//!
//! Exit policy:
//! - exit code `0` or no code: clean stop, state becomes `stopped` and the URL
//!   is cleared
//! - any other code: crash, reported on the terminal, the last URL and port
//!   are kept and the lifecycle is never forced to `error`
//! - exits of superseded processes are ignored

use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::DevenvConfig;
use crate::files::MANIFEST;
use crate::guard::InFlight;
use crate::manifest;
use crate::orchestrator::state::{LifecycleState, StateHandle};
use crate::sandbox::{ProcessControl, Sandbox, ServerReady, SpawnOptions};
use crate::terminal::Terminal;

static PREVIEW_URI_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"exp://[^\s'"<>]+"#).unwrap());

/// Find a mobile preview URI in a chunk of process output.
pub fn find_preview_uri(chunk: &str) -> Option<String> {
    let plain = console::strip_ansi_codes(chunk);
    PREVIEW_URI_REGEX
        .find(&plain)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ')']).to_string())
}

/// Launch settings for the dev server.
#[derive(Debug, Clone)]
pub struct DevServerOptions {
    pub package_manager: String,
    pub port: u16,
    pub host: String,
    pub env: std::collections::BTreeMap<String, String>,
    /// How long to wait for readiness before warning.
    pub watchdog: Duration,
    /// How long a killed predecessor gets to exit.
    pub kill_grace: Duration,
}

impl DevServerOptions {
    pub fn from_config(config: &DevenvConfig) -> Self {
        Self {
            package_manager: config.sandbox.package_manager.clone(),
            port: config.devserver.port,
            host: config.devserver.host.clone(),
            env: config.sandbox.env.clone(),
            watchdog: config.watchdog(),
            kill_grace: config.kill_grace(),
        }
    }
}

impl Default for DevServerOptions {
    fn default() -> Self {
        Self::from_config(&DevenvConfig::default())
    }
}

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { id: u64 },
    /// Another start is in flight and has not spawned yet.
    AlreadyStarting,
    SpawnFailed(String),
}

#[derive(Debug)]
enum Readiness {
    Notified { port: u16, url: String },
    Forced,
}

struct Running {
    id: u64,
    control: Arc<dyn ProcessControl>,
    exited: watch::Receiver<bool>,
}

struct Inner {
    options: DevServerOptions,
    terminal: Terminal,
    state: StateHandle,
    starting: InFlight,
    started: AtomicBool,
    spawn_lock: tokio::sync::Mutex<()>,
    current: Mutex<Option<Running>>,
    readiness: Mutex<Option<oneshot::Sender<Readiness>>>,
}

impl Inner {
    fn current(&self) -> MutexGuard<'_, Option<Running>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn readiness(&self) -> MutexGuard<'_, Option<oneshot::Sender<Readiness>>> {
        self.readiness.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn current_id(&self) -> Option<u64> {
        self.current().as_ref().map(|r| r.id)
    }

    fn is_current(&self, id: u64) -> bool {
        self.current_id() == Some(id)
    }

    /// Kill the tracked process and give it `kill_grace` to exit.
    async fn kill_current(&self) {
        let previous = self.current().take();
        self.readiness().take();
        let Some(running) = previous else {
            return;
        };

        tracing::info!(id = running.id, "stopping previous dev server");
        running.control.kill();
        let mut exited = running.exited;
        let wait = async move {
            loop {
                let done = *exited.borrow_and_update();
                if done || exited.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.options.kill_grace, wait).await.is_err() {
            tracing::warn!(
                id = running.id,
                grace_ms = self.options.kill_grace.as_millis() as u64,
                "previous dev server did not exit within grace period"
            );
        }
    }

    fn handle_exit(&self, id: u64, code: Option<i32>) {
        let was_current = {
            let mut current = self.current();
            if current.as_ref().is_some_and(|r| r.id == id) {
                current.take();
                true
            } else {
                false
            }
        };
        if !was_current {
            tracing::debug!(id, ?code, "superseded dev server exited");
            return;
        }

        self.readiness().take();
        self.starting.clear();
        self.started.store(false, Ordering::Release);

        match code {
            Some(0) | None => {
                self.terminal.info("Dev server stopped");
                tracing::info!(id, ?code, "dev server exited cleanly");
                self.state.update(|s| {
                    s.lifecycle = LifecycleState::Stopped;
                    s.url = None;
                    s.port = None;
                    s.last_exit_code = code;
                });
            }
            Some(code) => {
                self.terminal
                    .error(&format!("Dev server exited with code {}", code));
                tracing::warn!(id, code, "dev server crashed");
                self.state.update(|s| {
                    s.last_exit_code = Some(code);
                    if s.lifecycle == LifecycleState::Starting {
                        s.lifecycle = LifecycleState::Stopped;
                    }
                });
            }
        }
    }

    fn apply_readiness(&self, readiness: Readiness) {
        self.starting.clear();
        let default_port = self.options.port;
        let (port, url) = match readiness {
            Readiness::Notified { port, url } => (port, url),
            Readiness::Forced => {
                let snapshot = self.state.snapshot();
                let port = snapshot.port.unwrap_or(default_port);
                let url = snapshot
                    .url
                    .unwrap_or_else(|| format!("http://localhost:{}", port));
                tracing::info!("dev server forced ready");
                (port, url)
            }
        };
        self.terminal.info(&format!("Dev server ready at {}", url));
        tracing::info!(port, url = %url, "dev server ready");
        self.state.update(|s| {
            s.lifecycle = LifecycleState::Ready;
            s.port = Some(port);
            s.url = Some(url);
            s.error = None;
        });
    }
}

/// Cloneable handle to the dev-server supervisor.
#[derive(Clone)]
pub struct DevServerSupervisor {
    inner: Arc<Inner>,
}

impl DevServerSupervisor {
    pub fn new(options: DevServerOptions, terminal: Terminal, state: StateHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                terminal,
                state,
                starting: InFlight::new(),
                started: AtomicBool::new(false),
                spawn_lock: tokio::sync::Mutex::new(()),
                current: Mutex::new(None),
                readiness: Mutex::new(None),
            }),
        }
    }

    pub fn options(&self) -> &DevServerOptions {
        &self.inner.options
    }

    /// Whether a start is waiting for readiness.
    pub fn is_starting(&self) -> bool {
        self.inner.starting.is_set()
    }

    /// Whether a dev server was started and has not exited since.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Forget that the server was started, so the next cycle starts it again.
    pub fn mark_not_started(&self) {
        self.inner.started.store(false, Ordering::Release);
    }

    pub fn current_id(&self) -> Option<u64> {
        self.inner.current_id()
    }

    /// Start the dev server, replacing any running one.
    pub async fn start(&self, sandbox: &dyn Sandbox) -> StartOutcome {
        let inner = &self.inner;
        let guard = inner.starting.try_acquire();
        if guard.is_none() && inner.current_id().is_none() {
            tracing::debug!("dev server start already in flight");
            return StartOutcome::AlreadyStarting;
        }

        let _spawning = inner.spawn_lock.lock().await;
        inner.kill_current().await;

        let manifest_text = sandbox.read_file(MANIFEST).await.ok();
        let launch =
            manifest::launch_command(manifest_text.as_deref(), &inner.options.package_manager);
        inner.terminal.info(&format!("$ {}", launch));
        inner.state.update(|s| {
            s.lifecycle = LifecycleState::Starting;
            s.error = None;
        });

        let mut env = inner.options.env.clone();
        env.insert("PORT".to_string(), inner.options.port.to_string());
        env.insert("HOST".to_string(), inner.options.host.clone());

        let (ready_tx, ready_rx) = oneshot::channel();
        *inner.readiness() = Some(ready_tx);

        let options = SpawnOptions { cwd: None, env };
        let process = match sandbox.spawn(&launch.command, &launch.args, options).await {
            Ok(process) => process,
            Err(e) => {
                inner.readiness().take();
                inner.starting.clear();
                inner.started.store(false, Ordering::Release);
                let message = e.to_string();
                inner
                    .terminal
                    .error(&format!("Failed to start dev server: {}", message));
                tracing::error!(command = %launch, error = %message, "dev server spawn failed");
                inner.state.update(|s| {
                    s.lifecycle = LifecycleState::Stopped;
                    s.error = Some(message.clone());
                });
                return StartOutcome::SpawnFailed(message);
            }
        };

        let id = process.id;
        let (exited_tx, exited_rx) = watch::channel(false);
        *inner.current() = Some(Running {
            id,
            control: Arc::clone(&process.control),
            exited: exited_rx,
        });
        inner.started.store(true, Ordering::Release);
        if let Some(guard) = guard {
            guard.keep();
        }
        tracing::info!(id, command = %launch, port = inner.options.port, "dev server spawned");

        let mut output = process.output;
        let terminal = inner.terminal.clone();
        let state = inner.state.clone();
        tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                terminal.write(&chunk);
                if let Some(uri) = find_preview_uri(&chunk)
                    && state.snapshot().mobile_preview_url.as_deref() != Some(uri.as_str())
                {
                    tracing::info!(uri = %uri, "mobile preview available");
                    state.update(|s| s.mobile_preview_url = Some(uri));
                }
            }
        });

        let exit_inner = Arc::clone(inner);
        let exit = process.exit;
        tokio::spawn(async move {
            let code = exit.await.unwrap_or(None);
            let _ = exited_tx.send(true);
            exit_inner.handle_exit(id, code);
        });

        tokio::spawn(await_ready(Arc::clone(inner), id, ready_rx));
        StartOutcome::Started { id }
    }

    /// Kill the current process and start a new one.
    pub async fn restart(&self, sandbox: &dyn Sandbox) -> StartOutcome {
        self.inner.terminal.info("Restarting dev server");
        self.start(sandbox).await
    }

    /// Route a runtime `server-ready` notification.
    pub fn handle_server_ready(&self, ready: ServerReady) {
        let pending = self.inner.readiness().take();
        match pending {
            Some(tx) => {
                let _ = tx.send(Readiness::Notified {
                    port: ready.port,
                    url: ready.url,
                });
            }
            None if self.inner.current_id().is_some() => {
                // The server announced again after it was already ready.
                self.inner.apply_readiness(Readiness::Notified {
                    port: ready.port,
                    url: ready.url,
                });
            }
            None => {
                tracing::debug!(port = ready.port, "server-ready with no dev server tracked");
            }
        }
    }

    /// Manual override: treat the pending start as ready. Returns `false` when
    /// no start is waiting.
    pub fn force_ready(&self) -> bool {
        match self.inner.readiness().take() {
            Some(tx) => tx.send(Readiness::Forced).is_ok(),
            None => false,
        }
    }

    /// Forward the sandbox's `server-ready` notifications to this supervisor.
    pub fn spawn_ready_listener(&self, sandbox: &dyn Sandbox) -> JoinHandle<()> {
        let mut rx = sandbox.server_ready();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ready) => this.handle_server_ready(ready),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "server-ready listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Kill the dev server without starting another. Returns whether a process
    /// was running.
    pub fn stop(&self) -> bool {
        let previous = self.inner.current().take();
        self.inner.readiness().take();
        self.inner.starting.clear();
        self.inner.started.store(false, Ordering::Release);
        match previous {
            Some(running) => {
                tracing::info!(id = running.id, "killing dev server");
                running.control.kill();
                true
            }
            None => false,
        }
    }
}

async fn await_ready(inner: Arc<Inner>, id: u64, mut ready_rx: oneshot::Receiver<Readiness>) {
    let first = tokio::select! {
        result = &mut ready_rx => Some(result),
        _ = tokio::time::sleep(inner.options.watchdog) => None,
    };

    let result = match first {
        Some(result) => result,
        None => {
            if inner.is_current(id) {
                let secs = inner.options.watchdog.as_secs();
                tracing::warn!(id, secs, "dev server has not reported ready");
                inner.terminal.warn(&format!(
                    "Dev server has not reported ready after {}s; still waiting",
                    secs
                ));
                inner.starting.clear();
            }
            ready_rx.await
        }
    };

    // Sender dropped: superseded, stopped or exited.
    let Ok(readiness) = result else {
        return;
    };
    if inner.is_current(id) {
        inner.apply_readiness(readiness);
    }
}
