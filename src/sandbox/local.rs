//! Host-directory sandbox runtime.
//!
//! Backs the sandbox filesystem with a directory on disk, runs processes with
//! `tokio::process`, watches with `notify`, and announces `server-ready` once
//! the `PORT` a process was started with accepts TCP connections.

use anyhow::Context;
use async_trait::async_trait;
use notify::{RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{Notify, broadcast, mpsc, oneshot};

use super::{
    DirEntry, FileNode, FileTree, ProcessControl, Sandbox, SandboxProcess, SandboxRuntime,
    ServerReady, SpawnOptions, WatchEvent, WatchKind,
};
use crate::errors::SandboxError;
use crate::files;

/// How often a spawned process's port is probed for readiness.
const PORT_PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// How long a killed process group gets after SIGTERM before SIGKILL.
#[cfg(unix)]
const TERM_GRACE: Duration = Duration::from_millis(1500);

/// Runtime rooted at a host directory.
pub struct LocalRuntime {
    root: PathBuf,
    instance: Mutex<Option<Arc<LocalSandbox>>>,
}

impl LocalRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            instance: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    async fn boot(&self) -> Result<Arc<dyn Sandbox>, SandboxError> {
        if self
            .instance
            .lock()
            .map_err(|_| SandboxError::Boot("runtime lock poisoned".into()))?
            .is_some()
        {
            return Err(SandboxError::AlreadyBooted);
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| SandboxError::Boot(format!("{}: {}", self.root.display(), e)))?;
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|e| SandboxError::Boot(format!("{}: {}", self.root.display(), e)))?;

        let sandbox = Arc::new(LocalSandbox::new(root));
        let mut slot = self
            .instance
            .lock()
            .map_err(|_| SandboxError::Boot("runtime lock poisoned".into()))?;
        if slot.is_some() {
            return Err(SandboxError::AlreadyBooted);
        }
        *slot = Some(Arc::clone(&sandbox));
        tracing::info!(root = %sandbox.root.display(), "local sandbox booted");
        Ok(sandbox)
    }

    fn instance(&self) -> Option<Arc<dyn Sandbox>> {
        self.instance
            .lock()
            .ok()?
            .as_ref()
            .map(|s| Arc::clone(s) as Arc<dyn Sandbox>)
    }
}

/// A sandbox whose filesystem is a host directory.
pub struct LocalSandbox {
    root: PathBuf,
    ready_tx: broadcast::Sender<ServerReady>,
    watchers: Mutex<Vec<notify::RecommendedWatcher>>,
    processes: Arc<Mutex<HashMap<u64, Arc<LocalProcessControl>>>>,
    next_pid: Mutex<u64>,
}

impl LocalSandbox {
    fn new(root: PathBuf) -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            root,
            ready_tx,
            watchers: Mutex::new(Vec::new()),
            processes: Arc::new(Mutex::new(HashMap::new())),
            next_pid: Mutex::new(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a project-relative path under the root. `..` segments are
    /// rejected so nothing escapes the sandbox directory.
    fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let normalized = files::normalize_path(path);
        if normalized.split('/').any(|s| s == "..") {
            return Err(SandboxError::Io {
                path: normalized,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path escapes the sandbox root",
                ),
            });
        }
        Ok(if normalized.is_empty() {
            self.root.clone()
        } else {
            self.root.join(normalized)
        })
    }

    fn relative(&self, absolute: &Path) -> String {
        absolute
            .strip_prefix(&self.root)
            .map(|p| files::normalize_path(&p.to_string_lossy()))
            .unwrap_or_else(|_| files::normalize_path(&absolute.to_string_lossy()))
    }

    fn next_id(&self) -> u64 {
        let mut next = self.next_pid.lock().unwrap_or_else(|p| p.into_inner());
        let id = *next;
        *next += 1;
        id
    }

    fn write_tree<'a>(
        &'a self,
        dir: PathBuf,
        tree: &'a FileTree,
    ) -> futures::future::BoxFuture<'a, Result<(), SandboxError>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| SandboxError::io(self.relative(&dir), e))?;
            for (name, node) in tree {
                let path = dir.join(name);
                match node {
                    FileNode::File { contents } => tokio::fs::write(&path, contents)
                        .await
                        .map_err(|e| SandboxError::io(self.relative(&path), e))?,
                    FileNode::Directory(children) => self.write_tree(path, children).await?,
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn mount(&self, tree: &FileTree) -> Result<(), SandboxError> {
        self.write_tree(self.root.clone(), tree).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError> {
        let dir = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| SandboxError::io(path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| SandboxError::io(path, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let file = self.resolve(path)?;
        tokio::fs::read_to_string(&file)
            .await
            .map_err(|e| SandboxError::io(path, e))
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), SandboxError> {
        let file = self.resolve(path)?;
        tokio::fs::write(&file, contents)
            .await
            .map_err(|e| SandboxError::io(path, e))
    }

    async fn mkdir(&self, path: &str) -> Result<(), SandboxError> {
        let dir = self.resolve(path)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SandboxError::io(path, e))
    }

    async fn remove(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        let target = self.resolve(path)?;
        let metadata = tokio::fs::symlink_metadata(&target)
            .await
            .map_err(|e| SandboxError::io(path, e))?;
        let result = if !metadata.is_dir() {
            tokio::fs::remove_file(&target).await
        } else if target == self.root {
            // Never remove the root itself, only what it contains.
            let mut reader = tokio::fs::read_dir(&target)
                .await
                .map_err(|e| SandboxError::io(path, e))?;
            let mut result = Ok(());
            while let Ok(Some(entry)) = reader.next_entry().await {
                let child = entry.path();
                let removed = match entry.file_type().await {
                    Ok(t) if t.is_dir() && recursive => tokio::fs::remove_dir_all(&child).await,
                    Ok(t) if t.is_dir() => tokio::fs::remove_dir(&child).await,
                    _ => tokio::fs::remove_file(&child).await,
                };
                if removed.is_err() && result.is_ok() {
                    result = removed;
                }
            }
            result
        } else if recursive {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_dir(&target).await
        };
        result.map_err(|e| SandboxError::io(path, e))
    }

    fn watch(&self) -> Result<mpsc::UnboundedReceiver<WatchEvent>, SandboxError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let root = self.root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "sandbox watch error");
                    return;
                }
            };
            let kind = match event.kind {
                notify::EventKind::Create(_) | notify::EventKind::Remove(_) => WatchKind::Rename,
                notify::EventKind::Modify(notify::event::ModifyKind::Name(_)) => WatchKind::Rename,
                notify::EventKind::Modify(_) => WatchKind::Change,
                _ => return,
            };
            for path in event.paths {
                let relative = path
                    .strip_prefix(&root)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| path.to_string_lossy().into_owned());
                let _ = tx.send(WatchEvent {
                    kind,
                    path: relative,
                });
            }
        })
        .map_err(|e| SandboxError::Watch(e.to_string()))?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| SandboxError::Watch(e.to_string()))?;
        self.watchers
            .lock()
            .map_err(|_| SandboxError::Watch("watcher lock poisoned".into()))?
            .push(watcher);
        Ok(rx)
    }

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<SandboxProcess, SandboxError> {
        let cwd = self.resolve(options.cwd.as_deref().unwrap_or(""))?;
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(&cwd)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a kill reaches the servers a package manager
        // starts underneath it.
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd.spawn().map_err(|e| SandboxError::Spawn {
            command: command.to_string(),
            message: e.to_string(),
        })?;
        let pgid = child.id();

        let id = self.next_id();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let control = Arc::new(LocalProcessControl {
            kill: Notify::new(),
        });

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(stdout, output_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(stderr, output_tx));
        }

        self.processes
            .lock()
            .map_err(|_| SandboxError::Spawn {
                command: command.to_string(),
                message: "process table lock poisoned".into(),
            })?
            .insert(id, Arc::clone(&control));

        let (exited_tx, exited_rx) = tokio::sync::watch::channel(false);
        let waiter_control = Arc::clone(&control);
        let table = Arc::clone(&self.processes);
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = waiter_control.kill.notified() => {
                    terminate(&mut child, pgid).await;
                    None
                }
            };
            if let Ok(mut table) = table.lock() {
                table.remove(&id);
            }
            let _ = exited_tx.send(true);
            let _ = exit_tx.send(code);
        });

        if let Some(port) = options.env.get("PORT").and_then(|p| p.parse::<u16>().ok()) {
            tokio::spawn(probe_port(port, self.ready_tx.clone(), exited_rx));
        }

        tracing::debug!(id, command, ?args, cwd = %cwd.display(), "spawned sandbox process");
        Ok(SandboxProcess {
            id,
            output: output_rx,
            exit: exit_rx,
            control,
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn teardown(&self) {
        let processes = self
            .processes
            .lock()
            .map(|p| p.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        for process in processes {
            process.kill();
        }
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.clear();
        }
    }
}

struct LocalProcessControl {
    kill: Notify,
}

impl ProcessControl for LocalProcessControl {
    fn kill(&self) {
        self.kill.notify_one();
    }
}

/// Stop `child` and everything in its process group: SIGTERM, a short grace
/// period, then SIGKILL for whatever is left.
async fn terminate(child: &mut tokio::process::Child, pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pgid) = pgid.and_then(|p| libc::pid_t::try_from(p).ok()) {
        unsafe {
            libc::kill(-pgid, libc::SIGTERM);
        }
        let _ = tokio::time::timeout(TERM_GRACE, child.wait()).await;
        // The leader may be gone while children it started still hold ports.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
    let _ = child.kill().await;
}

async fn pump_output<R>(mut reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(String::from_utf8_lossy(&buf[..n]).into_owned()).is_err() {
                    break;
                }
            }
        }
    }
}

/// Announce `server-ready` once `port` accepts connections, unless the
/// process exits first.
async fn probe_port(
    port: u16,
    ready_tx: broadcast::Sender<ServerReady>,
    mut exited: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(PORT_PROBE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                    let _ = ready_tx.send(ServerReady {
                        port,
                        url: format!("http://localhost:{}", port),
                    });
                    return;
                }
            }
            changed = exited.changed() => {
                if changed.is_err() || *exited.borrow() {
                    return;
                }
            }
        }
    }
}

/// Create a runtime rooted at `dir`, creating the directory first.
pub fn runtime_at(dir: &Path) -> anyhow::Result<LocalRuntime> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create sandbox directory {}", dir.display()))?;
    Ok(LocalRuntime::new(dir))
}
