//! External document store.
//!
//! The store owns the desired file set. The orchestrator reads the whole
//! mapping and replaces it wholesale; no finer transactional semantics are
//! assumed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::CONFIG_DIR;
use crate::files::{self, FileMap, IgnoreFilter};

#[async_trait]
pub trait FileStore: Send + Sync {
    async fn current_files(&self) -> Result<FileMap>;

    /// Replace the stored mapping with `files`.
    async fn update_files(&self, files: FileMap) -> Result<()>;
}

/// In-memory store that counts updates.
#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<FileMap>,
    updates: Mutex<Vec<FileMap>>,
    fail_updates: Mutex<bool>,
}

impl MemoryStore {
    pub fn new(files: FileMap) -> Self {
        Self {
            files: Mutex::new(files),
            ..Default::default()
        }
    }

    pub fn files(&self) -> FileMap {
        self.files.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Replace the mapping without recording an update, as the editor would.
    pub fn set_files(&self, files: FileMap) {
        *self.files.lock().unwrap_or_else(|p| p.into_inner()) = files;
    }

    /// Every mapping passed to `update_files`, in order.
    pub fn updates(&self) -> Vec<FileMap> {
        self.updates.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Make subsequent updates fail.
    pub fn fail_updates(&self, fail: bool) {
        *self.fail_updates.lock().unwrap_or_else(|p| p.into_inner()) = fail;
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn current_files(&self) -> Result<FileMap> {
        Ok(self.files())
    }

    async fn update_files(&self, files: FileMap) -> Result<()> {
        if *self.fail_updates.lock().unwrap_or_else(|p| p.into_inner()) {
            anyhow::bail!("store rejected update");
        }
        self.updates
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(files.clone());
        self.set_files(files);
        Ok(())
    }
}

/// A project directory used as the store. Ignored paths are neither listed
/// nor deleted. [`CONFIG_DIR`] is always excluded, whatever the ignore list
/// says.
pub struct DirStore {
    root: PathBuf,
    ignore: IgnoreFilter,
    excluded: Vec<String>,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>, ignore: IgnoreFilter) -> Self {
        Self {
            root: root.into(),
            ignore,
            excluded: vec![CONFIG_DIR.to_string()],
        }
    }

    /// Also exclude `dir` (absolute, or relative to the root) when it lies
    /// inside the project, e.g. a sandbox directory.
    pub fn excluding(mut self, dir: &Path) -> Self {
        let relative = if dir.is_absolute() {
            dir.strip_prefix(&self.root).ok()
        } else {
            Some(dir)
        };
        if let Some(relative) = relative {
            let relative = files::normalize_path(&relative.to_string_lossy());
            if !relative.is_empty() && !self.excluded.contains(&relative) {
                self.excluded.push(relative);
            }
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `relative` is skipped by the ignore list or an exclusion.
    pub fn is_excluded(&self, relative: &str) -> bool {
        self.ignore.is_ignored(relative)
            || self.excluded.iter().any(|dir| {
                relative == dir
                    || relative
                        .strip_prefix(dir.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
    }

    fn list(&self) -> Result<FileMap> {
        let mut out = FileMap::new();
        let walker = walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|entry| {
                let relative = entry
                    .path()
                    .strip_prefix(&self.root)
                    .map(|p| files::normalize_path(&p.to_string_lossy()))
                    .unwrap_or_default();
                relative.is_empty() || !self.is_excluded(&relative)
            });
        for entry in walker {
            let entry = entry.context("Failed to walk project directory")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map(|p| files::normalize_path(&p.to_string_lossy()))
                .context("Walked outside the project directory")?;
            match std::fs::read_to_string(entry.path()) {
                Ok(contents) => {
                    out.insert(relative, contents);
                }
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    tracing::debug!(path = %relative, "skipping non-UTF-8 file");
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to read {}", entry.path().display()));
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl FileStore for DirStore {
    async fn current_files(&self) -> Result<FileMap> {
        self.list()
    }

    async fn update_files(&self, files: FileMap) -> Result<()> {
        let existing = self.list()?;
        for (path, contents) in &files {
            if existing.get(path) == Some(contents) || self.is_excluded(path) {
                continue;
            }
            let target = self.root.join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            tokio::fs::write(&target, contents)
                .await
                .with_context(|| format!("Failed to write {}", target.display()))?;
        }
        for path in existing.keys().filter(|p| !files.contains_key(*p)) {
            let target = self.root.join(path);
            if let Err(e) = tokio::fs::remove_file(&target).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                return Err(e).with_context(|| format!("Failed to remove {}", target.display()));
            }
        }
        Ok(())
    }
}
