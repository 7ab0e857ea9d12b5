//! Dependency install supervisor.
//!
//! Runs the package manager's install command at the sandbox root, streams its
//! output to the terminal, and reports whether it exited cleanly. At most one
//! install runs at a time.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::guard::InFlight;
use crate::sandbox::{ProcessControl, Sandbox, SpawnOptions};
use crate::terminal::Terminal;

/// How long to wait for buffered output after the process has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Succeeded,
    /// Exited with a non-zero (or missing) code.
    Failed { code: Option<i32> },
    /// The command could not be started.
    SpawnFailed(String),
    /// Another install is running; this request did nothing.
    AlreadyRunning,
}

impl InstallOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

pub struct InstallSupervisor {
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    terminal: Terminal,
    installing: InFlight,
    current: Mutex<Option<Arc<dyn ProcessControl>>>,
}

impl InstallSupervisor {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        terminal: Terminal,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            env,
            terminal,
            installing: InFlight::new(),
            current: Mutex::new(None),
        }
    }

    pub fn is_installing(&self) -> bool {
        self.installing.is_set()
    }

    fn set_current(&self, control: Option<Arc<dyn ProcessControl>>) {
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = control;
    }

    /// Run the install to completion.
    pub async fn run(&self, sandbox: &dyn Sandbox) -> InstallOutcome {
        let Some(_guard) = self.installing.try_acquire() else {
            tracing::debug!("install already running");
            return InstallOutcome::AlreadyRunning;
        };

        let command_line = std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        self.terminal.info(&format!("$ {}", command_line));
        tracing::info!(command = %command_line, "installing dependencies");

        let options = SpawnOptions {
            cwd: None,
            env: self.env.clone(),
        };
        let process = match sandbox.spawn(&self.command, &self.args, options).await {
            Ok(process) => process,
            Err(e) => {
                self.terminal.error(&format!("Failed to start install: {}", e));
                tracing::error!(error = %e, "install spawn failed");
                return InstallOutcome::SpawnFailed(e.to_string());
            }
        };

        self.set_current(Some(Arc::clone(&process.control)));
        let mut output = process.output;
        let terminal = self.terminal.clone();
        let forward = tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                terminal.write(&chunk);
            }
        });

        let code = process.exit.await.unwrap_or(None);
        self.set_current(None);
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, forward).await.is_err() {
            tracing::debug!("install output still open after exit");
        }

        match code {
            Some(0) => {
                self.terminal.info("Dependencies installed");
                tracing::info!("install succeeded");
                InstallOutcome::Succeeded
            }
            code => {
                let shown = code.map_or_else(|| "none".to_string(), |c| c.to_string());
                self.terminal
                    .error(&format!("Install failed with exit code {}", shown));
                tracing::warn!(?code, "install failed");
                InstallOutcome::Failed { code }
            }
        }
    }

    /// Kill a running install, if any.
    pub fn kill(&self) {
        let current = self.current.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(control) = current {
            tracing::debug!("killing install process");
            control.kill();
        }
    }
}
