//! Run the development environment - `devenv up`.
//!
//! The project directory plays the external store: its files are mounted into
//! a host-directory sandbox, edits to the project are re-synced after a quiet
//! period, and changes made inside the sandbox are written back.

use anyhow::{Context, Result};
use console::style;
use futures::FutureExt;
use notify::{RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use devenv::config::CONFIG_DIR;
use devenv::debounce::Debouncer;
use devenv::files::{self, IgnoreFilter};
use devenv::sandbox::local::runtime_at;
use devenv::store::{DirStore, FileStore};
use devenv::terminal::{StdoutSurface, Terminal};
use devenv::{DevenvConfig, LifecycleState, Orchestrator, SyncMode};

pub async fn cmd_up(project_dir: &Path, sandbox_dir: Option<PathBuf>) -> Result<()> {
    let project_dir = std::fs::canonicalize(project_dir)
        .with_context(|| format!("Project directory not found: {}", project_dir.display()))?;
    let config = DevenvConfig::load(&project_dir)?;
    let sandbox_dir = sandbox_dir.unwrap_or_else(|| project_dir.join(CONFIG_DIR).join("sandbox"));

    let runtime = Arc::new(runtime_at(&sandbox_dir)?);
    let sandbox_dir = std::fs::canonicalize(&sandbox_dir).unwrap_or(sandbox_dir);
    let ignore = IgnoreFilter::new(&config.sync.ignore);
    let store = Arc::new(DirStore::new(&project_dir, ignore).excluding(&sandbox_dir));
    let terminal = Terminal::new();
    terminal.attach(Arc::new(StdoutSurface));

    let orchestrator = Orchestrator::new(config.clone(), runtime, store.clone(), terminal.clone());
    terminal.line(&format!(
        "{} {} (sandbox: {})",
        style("devenv").bold(),
        style(project_dir.display()).cyan(),
        sandbox_dir.display()
    ));
    tracing::info!(session = %orchestrator.session_id(), "session started");

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = event_tx.send(event);
        }
    })
    .context("Failed to create project watcher")?;
    watcher
        .watch(&project_dir, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {}", project_dir.display()))?;

    let status = spawn_status_reporter(&orchestrator, terminal.clone());
    resync(&orchestrator, store.as_ref()).await;

    let resync_orchestrator = orchestrator.clone();
    let resync_store = Arc::clone(&store);
    let debouncer = Debouncer::spawn(config.debounce(), move || {
        let orchestrator = resync_orchestrator.clone();
        let store = Arc::clone(&resync_store);
        async move { resync(&orchestrator, store.as_ref()).await }.boxed()
    });

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                }
                break;
            }
            Some(event) = events.recv() => {
                if touches_project(&project_dir, &store, &event) {
                    debouncer.trigger();
                }
            }
        }
    }

    debouncer.cancel();
    drop(watcher);
    terminal.line("");
    orchestrator.flush_reverse_sync().await;
    orchestrator.stop().await;
    status.abort();
    Ok(())
}

/// Read the project and hand it to the orchestrator. Failures are already on
/// the terminal and in the observable state, so they are only logged here.
async fn resync(orchestrator: &Orchestrator, store: &dyn FileStore) {
    let files = match store.current_files().await {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read project files");
            return;
        }
    };
    if let Err(e) = orchestrator.sync(files, SyncMode::Settled).await {
        tracing::debug!(error = %e, "sync did not complete");
    }
}

fn touches_project(project_dir: &Path, store: &DirStore, event: &notify::Event) -> bool {
    event.paths.iter().any(|path| {
        path.strip_prefix(project_dir)
            .map(|relative| files::normalize_path(&relative.to_string_lossy()))
            .is_ok_and(|relative| !relative.is_empty() && !store.is_excluded(&relative))
    })
}

fn spawn_status_reporter(
    orchestrator: &Orchestrator,
    terminal: Terminal,
) -> tokio::task::JoinHandle<()> {
    let mut rx = orchestrator.subscribe();
    tokio::spawn(async move {
        let mut last = rx.borrow().clone();
        while rx.changed().await.is_ok() {
            let state = rx.borrow_and_update().clone();
            if state.lifecycle != last.lifecycle {
                tracing::info!(lifecycle = %state.lifecycle, "state changed");
                if state.lifecycle == LifecycleState::Error
                    && let Some(error) = &state.error
                {
                    terminal.error(&format!("Waiting for changes: {}", error));
                }
            }
            if state.mobile_preview_url != last.mobile_preview_url
                && let Some(uri) = &state.mobile_preview_url
            {
                terminal.info(&format!("Mobile preview: {}", uri));
            }
            last = state;
        }
    })
}
