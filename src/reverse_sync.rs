//! Reverse sync: sandbox-side changes flow back to the external store.
//!
//! A watcher task turns filesystem notifications into staged entries
//! (`path -> content` or a tombstone). A [`Debouncer`] coalesces bursts so the
//! store receives at most one update per quiet period.

use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::debounce::Debouncer;
use crate::errors::SandboxError;
use crate::files::{self, FileMap, IgnoreFilter, MANIFEST};
use crate::guard::InFlight;
use crate::manifest;
use crate::reconcile::MountedFiles;
use crate::sandbox::{Sandbox, WatchEvent};
use crate::store::FileStore;

/// Staged change: new content, or `None` for a deletion.
type Pending = BTreeMap<String, Option<String>>;

/// What a flush did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// Whether the store received an update.
    pub pushed: bool,
}

struct Shared {
    sandbox: Arc<dyn Sandbox>,
    store: Arc<dyn FileStore>,
    mounted: MountedFiles,
    ignore: IgnoreFilter,
    placeholder: String,
    stripped_flags: Vec<String>,
    mounting: InFlight,
    pending: Mutex<Pending>,
    flushing: tokio::sync::Mutex<()>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Inspect one notification and stage its effect. Returns whether
    /// anything was staged.
    async fn handle_event(&self, event: WatchEvent) -> bool {
        let path = files::normalize_path(&event.path);
        if path.is_empty() || self.ignore.is_ignored(&path) {
            return false;
        }
        if self.mounting.is_set() {
            tracing::trace!(path = %path, "ignoring change during bulk mount");
            return false;
        }

        if let Ok(entries) = self.sandbox.read_dir(&path).await {
            if entries.is_empty() {
                // Empty directories would vanish from a flat file map.
                let marker = files::join(&path, &self.placeholder);
                if let Err(e) = self.sandbox.write_file(&marker, "").await {
                    tracing::debug!(path = %marker, error = %e, "failed to write placeholder");
                }
            }
            return false;
        }

        let staged = match self.sandbox.read_file(&path).await {
            Ok(contents) => Some(contents),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                tracing::debug!(path = %path, error = %e, "unreadable sandbox path, skipping");
                return false;
            }
        };
        tracing::trace!(path = %path, deleted = staged.is_none(), "staged sandbox change");
        self.pending().insert(path, staged);
        true
    }

    async fn flush(&self) -> FlushReport {
        let _flushing = self.flushing.lock().await;
        let staged = std::mem::take(&mut *self.pending());
        if staged.is_empty() {
            return FlushReport::default();
        }

        let mounted = self.mounted.snapshot();
        let mut report = FlushReport::default();
        for (path, entry) in &staged {
            match entry {
                Some(contents) if !self.is_echo(path, contents, &mounted) => {
                    report.updated.push(path.clone());
                }
                Some(_) => {}
                None => {
                    let prefix = format!("{}/", path);
                    if mounted.contains_key(path) || mounted.keys().any(|k| k.starts_with(&prefix)) {
                        report.removed.push(path.clone());
                    }
                }
            }
        }
        if report.updated.is_empty() && report.removed.is_empty() {
            return report;
        }

        let current = match self.store.current_files().await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(error = %e, "could not read store, keeping changes staged");
                self.restage(staged);
                return FlushReport::default();
            }
        };
        let mut next = current.clone();
        for path in &report.removed {
            remove_tree(&mut next, path);
        }
        for path in &report.updated {
            if let Some(Some(contents)) = staged.get(path) {
                next.insert(path.clone(), contents.clone());
            }
        }

        if next != current {
            if let Err(e) = self.store.update_files(next).await {
                tracing::warn!(error = %e, "store update failed, keeping changes staged");
                self.restage(staged);
                return FlushReport::default();
            }
            report.pushed = true;
        }

        let mut mirror = self.mounted.snapshot();
        for path in &report.removed {
            remove_tree(&mut mirror, path);
        }
        for path in &report.updated {
            if let Some(Some(contents)) = staged.get(path) {
                mirror.insert(path.clone(), contents.clone());
            }
        }
        self.mounted.replace(mirror);

        tracing::info!(
            updated = report.updated.len(),
            removed = report.removed.len(),
            "synced sandbox changes to store"
        );
        report
    }

    /// Whether `contents` is what the orchestrator itself wrote for `path`.
    /// The manifest is written with its scripts normalized.
    fn is_echo(&self, path: &str, contents: &str, mounted: &FileMap) -> bool {
        let Some(mirror) = mounted.get(path) else {
            return false;
        };
        mirror == contents
            || (path == MANIFEST
                && manifest::normalize_scripts(mirror, &self.stripped_flags).as_deref()
                    == Some(contents))
    }

    /// Put entries back after a failed flush without clobbering newer ones.
    fn restage(&self, staged: Pending) {
        let mut pending = self.pending();
        for (path, entry) in staged {
            pending.entry(path).or_insert(entry);
        }
    }
}

fn remove_tree(map: &mut FileMap, path: &str) {
    let prefix = format!("{}/", path);
    map.retain(|k, _| k != path && !k.starts_with(&prefix));
}

/// Settings for [`ReverseSync::start`].
#[derive(Debug, Clone)]
pub struct ReverseSyncOptions {
    pub debounce: Duration,
    pub ignore: IgnoreFilter,
    pub placeholder: String,
    /// Flags stripped from manifest scripts on the way in.
    pub stripped_flags: Vec<String>,
}

/// Running reverse-sync watcher. Dropping it stops watching.
pub struct ReverseSync {
    shared: Arc<Shared>,
    debouncer: Debouncer,
    watcher: JoinHandle<()>,
}

impl ReverseSync {
    /// Start watching the sandbox root.
    pub fn start(
        sandbox: Arc<dyn Sandbox>,
        store: Arc<dyn FileStore>,
        mounted: MountedFiles,
        mounting: InFlight,
        options: ReverseSyncOptions,
    ) -> Result<Self, SandboxError> {
        let events = sandbox.watch()?;
        let shared = Arc::new(Shared {
            sandbox,
            store,
            mounted,
            ignore: options.ignore,
            placeholder: options.placeholder,
            stripped_flags: options.stripped_flags,
            mounting,
            pending: Mutex::new(Pending::new()),
            flushing: tokio::sync::Mutex::new(()),
        });

        let flush_shared = Arc::clone(&shared);
        let debouncer = Debouncer::spawn(options.debounce, move || {
            let shared = Arc::clone(&flush_shared);
            async move {
                shared.flush().await;
            }
            .boxed()
        });

        let watcher = tokio::spawn(watch_loop(Arc::clone(&shared), events, debouncer.trigger_handle()));
        tracing::debug!("reverse sync watching sandbox");
        Ok(Self {
            shared,
            debouncer,
            watcher,
        })
    }

    /// Number of staged, unflushed paths.
    pub fn pending_len(&self) -> usize {
        self.shared.pending().len()
    }

    /// Flush staged changes immediately.
    pub async fn flush_now(&self) -> FlushReport {
        self.shared.flush().await
    }

    pub fn stop(&self) {
        self.watcher.abort();
        self.debouncer.cancel();
    }
}

impl Drop for ReverseSync {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn watch_loop(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<WatchEvent>,
    trigger: crate::debounce::Trigger,
) {
    while let Some(event) = events.recv().await {
        if shared.handle_event(event).await {
            trigger.fire();
        }
    }
    tracing::debug!("sandbox watch stream closed");
}
