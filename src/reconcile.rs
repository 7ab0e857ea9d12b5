//! File reconciler: brings the sandbox filesystem in line with the desired
//! file set.
//!
//! The first pass bulk-mounts the whole tree; later passes write only the
//! paths whose content differs from the mounted mirror and delete the paths
//! that disappeared. Per-path failures are collected, never fatal to the
//! batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::SandboxError;
use crate::files::{self, FileMap, IgnoreFilter, MANIFEST};
use crate::guard::InFlight;
use crate::manifest;
use crate::sandbox::{Sandbox, build_tree};

/// The orchestrator's record of what it last wrote into the sandbox.
///
/// Shared between the reconciler (forward direction) and the reverse-sync
/// watcher; only ever read back from the sandbox on the reverse path.
#[derive(Debug, Clone, Default)]
pub struct MountedFiles {
    inner: Arc<Mutex<FileMap>>,
}

impl MountedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FileMap> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.lock().get(path).cloned()
    }

    pub fn insert(&self, path: &str, contents: &str) {
        self.lock().insert(path.to_string(), contents.to_string());
    }

    pub fn remove(&self, path: &str) -> Option<String> {
        self.lock().remove(path)
    }

    pub fn snapshot(&self) -> FileMap {
        self.lock().clone()
    }

    pub fn replace(&self, files: FileMap) {
        *self.lock() = files;
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    BulkMount,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Mkdir,
    Write,
    Remove,
}

/// A single path that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFailure {
    pub path: String,
    pub op: FileOp,
    pub message: String,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub mode: ReconcileMode,
    pub written: Vec<String>,
    pub deleted: Vec<String>,
    pub failures: Vec<PathFailure>,
    /// Mounted manifest content before this pass.
    pub previous_manifest: Option<String>,
}

impl ReconcileReport {
    fn new(mode: ReconcileMode, previous_manifest: Option<String>) -> Self {
        Self {
            mode,
            written: Vec::new(),
            deleted: Vec::new(),
            failures: Vec::new(),
            previous_manifest,
        }
    }

    /// Whether this pass touched the manifest.
    pub fn manifest_written(&self) -> bool {
        self.mode == ReconcileMode::BulkMount || self.written.iter().any(|p| p == MANIFEST)
    }

    pub fn is_noop(&self) -> bool {
        self.mode == ReconcileMode::Incremental
            && self.written.is_empty()
            && self.deleted.is_empty()
    }
}

/// Result of asking for a pass.
#[derive(Debug)]
pub enum ReconcileOutcome {
    Applied(ReconcileReport),
    /// Another pass is in flight; this request was dropped.
    Busy,
}

pub struct Reconciler {
    mounted: MountedFiles,
    ignore: IgnoreFilter,
    stripped_flags: Vec<String>,
    mounted_once: AtomicBool,
    syncing: InFlight,
    mounting: InFlight,
}

impl Reconciler {
    pub fn new(mounted: MountedFiles, ignore: IgnoreFilter, stripped_flags: Vec<String>) -> Self {
        Self {
            mounted,
            ignore,
            stripped_flags,
            mounted_once: AtomicBool::new(false),
            syncing: InFlight::new(),
            mounting: InFlight::new(),
        }
    }

    pub fn mounted(&self) -> &MountedFiles {
        &self.mounted
    }

    /// Set while a bulk mount is running.
    pub fn mounting(&self) -> &InFlight {
        &self.mounting
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.is_set()
    }

    pub fn has_mounted(&self) -> bool {
        self.mounted_once.load(Ordering::Acquire)
    }

    /// Forget the mounted state so the next pass bulk-mounts again.
    pub fn reset(&self) {
        self.mounted_once.store(false, Ordering::Release);
        self.mounted.replace(FileMap::new());
    }

    /// Desired files restricted to paths that are not ignored, with keys
    /// normalized.
    pub fn filter(&self, desired: &FileMap) -> FileMap {
        desired
            .iter()
            .map(|(path, contents)| (files::normalize_path(path), contents))
            .filter(|(path, _)| !path.is_empty() && !self.ignore.is_ignored(path))
            .map(|(path, contents)| (path, contents.clone()))
            .collect()
    }

    /// Content to put in the sandbox for `path`: the manifest gets its scripts
    /// normalized, everything else is written verbatim.
    fn sandbox_contents<'a>(&self, path: &str, contents: &'a str) -> std::borrow::Cow<'a, str> {
        if path == MANIFEST
            && let Some(normalized) = manifest::normalize_scripts(contents, &self.stripped_flags)
        {
            tracing::debug!("stripped unsupported flags from package.json scripts");
            return std::borrow::Cow::Owned(normalized);
        }
        std::borrow::Cow::Borrowed(contents)
    }

    /// Run one pass. Returns [`ReconcileOutcome::Busy`] without touching
    /// anything if a pass is already running.
    pub async fn reconcile(
        &self,
        sandbox: &dyn Sandbox,
        desired: &FileMap,
    ) -> Result<ReconcileOutcome, SandboxError> {
        let Some(_guard) = self.syncing.try_acquire() else {
            tracing::debug!("reconciliation already in flight, dropping request");
            return Ok(ReconcileOutcome::Busy);
        };

        let desired = self.filter(desired);
        let report = if self.has_mounted() {
            self.sync_incremental(sandbox, &desired).await
        } else {
            self.bulk_mount(sandbox, &desired).await?
        };

        if !report.failures.is_empty() {
            tracing::warn!(failures = report.failures.len(), "some files could not be synced");
        }
        Ok(ReconcileOutcome::Applied(report))
    }

    async fn bulk_mount(
        &self,
        sandbox: &dyn Sandbox,
        desired: &FileMap,
    ) -> Result<ReconcileReport, SandboxError> {
        let _mounting = self.mounting.try_acquire();
        let mut report = ReconcileReport::new(ReconcileMode::BulkMount, None);

        // The root may already be empty.
        if let Err(e) = sandbox.remove("", true).await {
            tracing::debug!(error = %e, "clearing sandbox root failed, continuing");
        }

        let prepared: FileMap = desired
            .iter()
            .map(|(path, contents)| {
                (path.clone(), self.sandbox_contents(path, contents).into_owned())
            })
            .collect();
        sandbox.mount(&build_tree(&prepared)).await?;

        self.mounted.replace(desired.clone());
        self.mounted_once.store(true, Ordering::Release);
        report.written = desired.keys().cloned().collect();
        tracing::info!(files = desired.len(), "mounted project tree");
        Ok(report)
    }

    async fn sync_incremental(&self, sandbox: &dyn Sandbox, desired: &FileMap) -> ReconcileReport {
        let mounted = self.mounted.snapshot();
        let mut report =
            ReconcileReport::new(ReconcileMode::Incremental, mounted.get(MANIFEST).cloned());

        for (path, contents) in desired {
            if mounted.get(path) == Some(contents) {
                continue;
            }
            if let Some(parent) = files::parent_dir(path)
                && let Err(e) = sandbox.mkdir(parent).await
            {
                report.failures.push(PathFailure {
                    path: parent.to_string(),
                    op: FileOp::Mkdir,
                    message: e.to_string(),
                });
                continue;
            }
            match sandbox
                .write_file(path, &self.sandbox_contents(path, contents))
                .await
            {
                Ok(()) => {
                    self.mounted.insert(path, contents);
                    report.written.push(path.clone());
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to write file");
                    report.failures.push(PathFailure {
                        path: path.clone(),
                        op: FileOp::Write,
                        message: e.to_string(),
                    });
                }
            }
        }

        for path in mounted.keys().filter(|p| !desired.contains_key(*p)) {
            match sandbox.remove(path, true).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to delete file");
                    report.failures.push(PathFailure {
                        path: path.clone(),
                        op: FileOp::Remove,
                        message: e.to_string(),
                    });
                }
            }
            self.mounted.remove(path);
            report.deleted.push(path.clone());
        }

        if !report.is_noop() {
            tracing::debug!(
                written = report.written.len(),
                deleted = report.deleted.len(),
                "incremental sync applied"
            );
        }
        report
    }
}
