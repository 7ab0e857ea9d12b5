//! In-memory sandbox runtime.
//!
//! Real implementation: [`super::local::LocalRuntime`]. This double keeps the
//! filesystem in a map, emits watch events for every mutation (including the
//! orchestrator's own writes, as a real sandbox would), and runs "processes"
//! that tests drive by hand: push output, emit `server-ready`, exit with a
//! code. Every call is recorded for assertions.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::{
    DirEntry, FileNode, FileTree, ProcessControl, Sandbox, SandboxProcess, SandboxRuntime,
    ServerReady, SpawnOptions, WatchEvent, WatchKind,
};
use crate::errors::SandboxError;
use crate::files::{self, FileMap};

/// Scripted behaviour for processes whose command line starts with a prefix.
#[derive(Debug, Clone, Default)]
pub struct ProcessScript {
    /// Chunks written to the output stream right after spawn.
    pub output: Vec<String>,
    /// Exit immediately after the output with this code. `None` keeps the
    /// process running until killed or exited by the test.
    pub exit: Option<Option<i32>>,
    /// Fail the spawn itself with this message.
    pub spawn_error: Option<String>,
}

impl ProcessScript {
    pub fn exits(code: i32) -> Self {
        Self {
            exit: Some(Some(code)),
            ..Default::default()
        }
    }

    pub fn runs() -> Self {
        Self::default()
    }

    pub fn fails_to_spawn(message: &str) -> Self {
        Self {
            spawn_error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, chunk: &str) -> Self {
        self.output.push(chunk.to_string());
        self
    }
}

/// A recorded spawn call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRecord {
    pub id: u64,
    pub command: String,
    pub args: Vec<String>,
    pub options: SpawnOptions,
}

impl SpawnRecord {
    /// `command args...` joined with spaces.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

struct LiveProcess {
    output: mpsc::UnboundedSender<String>,
    exit: oneshot::Sender<Option<i32>>,
}

#[derive(Default)]
struct FsState {
    files: FileMap,
    dirs: BTreeSet<String>,
    writes: Vec<String>,
    removals: Vec<String>,
    mounts: usize,
    watchers: Vec<mpsc::UnboundedSender<WatchEvent>>,
    scripts: Vec<(String, ProcessScript)>,
    spawned: Vec<SpawnRecord>,
    live: HashMap<u64, LiveProcess>,
    killed: Vec<u64>,
    next_pid: u64,
    torn_down: bool,
    failing: BTreeSet<String>,
}

impl FsState {
    fn dir_exists(&self, path: &str) -> bool {
        path.is_empty()
            || self.dirs.contains(path)
            || self.dirs.iter().any(|d| d.starts_with(&format!("{}/", path)))
            || self.files.keys().any(|f| f.starts_with(&format!("{}/", path)))
    }

    fn add_dir_with_ancestors(&mut self, path: &str) {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = files::join(&current, segment);
            self.dirs.insert(current.clone());
        }
    }

    fn notify(&mut self, kind: WatchKind, path: &str) {
        let event = WatchEvent {
            kind,
            path: format!("/{}", path),
        };
        self.watchers.retain(|w| w.send(event.clone()).is_ok());
    }

    fn ensure_live(&self) -> Result<(), SandboxError> {
        if self.torn_down {
            return Err(SandboxError::TornDown);
        }
        Ok(())
    }

    fn ensure_writable(&self, path: &str) -> Result<(), SandboxError> {
        if self.failing.contains(path) {
            return Err(SandboxError::Io {
                path: path.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        Ok(())
    }

    fn exit_process(&mut self, id: u64, code: Option<i32>) -> bool {
        match self.live.remove(&id) {
            Some(process) => {
                // Dropping the output sender closes the stream.
                let _ = process.exit.send(code);
                true
            }
            None => false,
        }
    }
}

/// The in-memory sandbox instance.
pub struct MemorySandbox {
    state: Arc<Mutex<FsState>>,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl Default for MemorySandbox {
    fn default() -> Self {
        let (ready_tx, _) = broadcast::channel(16);
        Self {
            state: Arc::new(Mutex::new(FsState {
                next_pid: 1,
                ..Default::default()
            })),
            ready_tx,
        }
    }
}

fn lock(state: &Mutex<FsState>) -> MutexGuard<'_, FsState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct MemoryProcessControl {
    id: u64,
    state: Arc<Mutex<FsState>>,
}

impl ProcessControl for MemoryProcessControl {
    fn kill(&self) {
        let mut state = lock(&self.state);
        state.killed.push(self.id);
        state.exit_process(self.id, None);
    }
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FsState> {
        lock(&self.state)
    }

    /// Script processes whose command line starts with `prefix`. Later scripts
    /// take precedence.
    pub fn script(&self, prefix: &str, script: ProcessScript) {
        self.lock().scripts.insert(0, (prefix.to_string(), script));
    }

    /// Current content of a file.
    pub fn file(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).cloned()
    }

    /// Snapshot of every file.
    pub fn files(&self) -> FileMap {
        self.lock().files.clone()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.lock().dir_exists(path)
    }

    /// Paths passed to `write_file`, in call order.
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    /// Paths passed to `remove`, in call order.
    pub fn removals(&self) -> Vec<String> {
        self.lock().removals.clone()
    }

    pub fn mount_count(&self) -> usize {
        self.lock().mounts
    }

    /// Make `write_file` and `mkdir` on exactly `path` fail until
    /// [`allow_writes_to`](Self::allow_writes_to) is called.
    pub fn fail_writes_to(&self, path: &str) {
        self.lock().failing.insert(files::normalize_path(path));
    }

    pub fn allow_writes_to(&self, path: &str) {
        self.lock().failing.remove(&files::normalize_path(path));
    }

    /// Forget recorded writes and removals.
    pub fn clear_records(&self) {
        let mut state = self.lock();
        state.writes.clear();
        state.removals.clear();
    }

    pub fn spawned(&self) -> Vec<SpawnRecord> {
        self.lock().spawned.clone()
    }

    /// Ids of processes that have not exited.
    pub fn running(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().live.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn killed(&self) -> Vec<u64> {
        self.lock().killed.clone()
    }

    /// Push an output chunk to a running process's stream.
    pub fn emit_output(&self, id: u64, chunk: &str) -> bool {
        self.lock()
            .live
            .get(&id)
            .is_some_and(|p| p.output.send(chunk.to_string()).is_ok())
    }

    /// End a running process with `code`.
    pub fn exit_process(&self, id: u64, code: Option<i32>) -> bool {
        self.lock().exit_process(id, code)
    }

    /// Announce that a server is listening.
    pub fn emit_server_ready(&self, port: u16, url: &str) {
        let _ = self.ready_tx.send(ServerReady {
            port,
            url: url.to_string(),
        });
    }

    /// Simulate a write made inside the sandbox (by a process or in-sandbox
    /// editor). Creates parents and emits a watch event but is not recorded
    /// as an orchestrator write.
    pub fn modify(&self, path: &str, contents: &str) {
        let mut state = self.lock();
        if let Some(parent) = files::parent_dir(path) {
            state.add_dir_with_ancestors(parent);
        }
        state.files.insert(path.to_string(), contents.to_string());
        state.notify(WatchKind::Change, path);
    }

    /// Simulate a deletion made inside the sandbox.
    pub fn delete(&self, path: &str) {
        let mut state = self.lock();
        state.files.remove(path);
        state.dirs.remove(path);
        state.notify(WatchKind::Rename, path);
    }

    /// Simulate a directory created inside the sandbox.
    pub fn make_dir(&self, path: &str) {
        let mut state = self.lock();
        state.add_dir_with_ancestors(path);
        state.notify(WatchKind::Rename, path);
    }
}

#[async_trait]
impl Sandbox for MemorySandbox {
    async fn mount(&self, tree: &FileTree) -> Result<(), SandboxError> {
        fn walk(state: &mut FsState, prefix: &str, tree: &FileTree) {
            for (name, node) in tree {
                let path = files::join(prefix, name);
                match node {
                    FileNode::File { contents } => {
                        state.files.insert(path.clone(), contents.clone());
                        state.notify(WatchKind::Change, &path);
                    }
                    FileNode::Directory(children) => {
                        state.dirs.insert(path.clone());
                        walk(state, &path, children);
                    }
                }
            }
        }

        let mut state = self.lock();
        state.ensure_live()?;
        state.mounts += 1;
        walk(&mut state, "", tree);
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError> {
        let path = files::normalize_path(path);
        let state = self.lock();
        state.ensure_live()?;
        if state.files.contains_key(&path) || !state.dir_exists(&path) {
            return Err(SandboxError::NotFound { path });
        }

        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };
        let mut entries: BTreeMap<String, bool> = BTreeMap::new();
        let children = state
            .files
            .keys()
            .map(|f| (f, false))
            .chain(state.dirs.iter().map(|d| (d, true)));
        for (full, is_dir) in children {
            let Some(rest) = full.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                Some((name, _)) => {
                    entries.insert(name.to_string(), true);
                }
                None => {
                    let entry = entries.entry(rest.to_string()).or_insert(is_dir);
                    *entry |= is_dir;
                }
            }
        }

        Ok(entries
            .into_iter()
            .map(|(name, is_dir)| DirEntry { name, is_dir })
            .collect())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let path = files::normalize_path(path);
        let state = self.lock();
        state.ensure_live()?;
        state
            .files
            .get(&path)
            .cloned()
            .ok_or(SandboxError::NotFound { path })
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), SandboxError> {
        let path = files::normalize_path(path);
        let mut state = self.lock();
        state.ensure_live()?;
        state.ensure_writable(&path)?;
        if let Some(parent) = files::parent_dir(&path)
            && !state.dir_exists(parent)
        {
            return Err(SandboxError::NotFound {
                path: parent.to_string(),
            });
        }
        state.writes.push(path.clone());
        state.files.insert(path.clone(), contents.to_string());
        state.notify(WatchKind::Change, &path);
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), SandboxError> {
        let path = files::normalize_path(path);
        let mut state = self.lock();
        state.ensure_live()?;
        state.ensure_writable(&path)?;
        state.add_dir_with_ancestors(&path);
        Ok(())
    }

    async fn remove(&self, path: &str, recursive: bool) -> Result<(), SandboxError> {
        let path = files::normalize_path(path);
        let mut state = self.lock();
        state.ensure_live()?;
        state.removals.push(path.clone());

        if path.is_empty() {
            if !recursive {
                return Err(SandboxError::Io {
                    path,
                    source: std::io::Error::other("cannot remove root without recursive"),
                });
            }
            state.files.clear();
            state.dirs.clear();
            return Ok(());
        }

        if state.files.remove(&path).is_some() {
            state.notify(WatchKind::Rename, &path);
            return Ok(());
        }
        if !state.dir_exists(&path) {
            return Err(SandboxError::NotFound { path });
        }

        let prefix = format!("{}/", path);
        let has_children = state.files.keys().any(|f| f.starts_with(&prefix))
            || state.dirs.iter().any(|d| d.starts_with(&prefix));
        if has_children && !recursive {
            return Err(SandboxError::Io {
                path,
                source: std::io::Error::other("directory not empty"),
            });
        }
        state.files.retain(|f, _| !f.starts_with(&prefix));
        state.dirs.retain(|d| d != &path && !d.starts_with(&prefix));
        state.notify(WatchKind::Rename, &path);
        Ok(())
    }

    fn watch(&self) -> Result<mpsc::UnboundedReceiver<WatchEvent>, SandboxError> {
        let mut state = self.lock();
        state.ensure_live()?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push(tx);
        Ok(rx)
    }

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<SandboxProcess, SandboxError> {
        let mut state = self.lock();
        state.ensure_live()?;

        let id = state.next_pid;
        state.next_pid += 1;
        let record = SpawnRecord {
            id,
            command: command.to_string(),
            args: args.to_vec(),
            options,
        };
        let line = record.command_line();
        state.spawned.push(record);

        let script = state
            .scripts
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, s)| s.clone())
            .unwrap_or_default();

        if let Some(message) = script.spawn_error {
            return Err(SandboxError::Spawn {
                command: line,
                message,
            });
        }

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        for chunk in &script.output {
            let _ = output_tx.send(chunk.clone());
        }

        match script.exit {
            Some(code) => {
                drop(output_tx);
                let _ = exit_tx.send(code);
            }
            None => {
                state.live.insert(
                    id,
                    LiveProcess {
                        output: output_tx,
                        exit: exit_tx,
                    },
                );
            }
        }

        Ok(SandboxProcess {
            id,
            output: output_rx,
            exit: exit_rx,
            control: Arc::new(MemoryProcessControl {
                id,
                state: Arc::clone(&self.state),
            }),
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn teardown(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.live.keys().copied().collect();
        for id in ids {
            state.exit_process(id, None);
        }
        state.watchers.clear();
        state.torn_down = true;
    }
}

/// Runtime that boots a single shared [`MemorySandbox`].
#[derive(Default)]
pub struct MemoryRuntime {
    sandbox: Arc<MemorySandbox>,
    booted: Mutex<bool>,
    boot_failure: Mutex<Option<String>>,
    boots: Mutex<usize>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sandbox this runtime hands out, for test inspection.
    pub fn sandbox(&self) -> Arc<MemorySandbox> {
        Arc::clone(&self.sandbox)
    }

    /// Make the next `boot` fail with `message`.
    pub fn fail_next_boot(&self, message: &str) {
        *self
            .boot_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(message.to_string());
    }

    /// Mark the sandbox as booted by someone else, so `boot` reports
    /// `AlreadyBooted`.
    pub fn preboot(&self) {
        *self.booted.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
    }

    /// Number of successful boots.
    pub fn boot_count(&self) -> usize {
        *self.boots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SandboxRuntime for MemoryRuntime {
    async fn boot(&self) -> Result<Arc<dyn Sandbox>, SandboxError> {
        if let Some(message) = self
            .boot_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            return Err(SandboxError::Boot(message));
        }
        let mut booted = self.booted.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *booted {
            return Err(SandboxError::AlreadyBooted);
        }
        *booted = true;
        *self.boots.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
        Ok(self.sandbox.clone() as Arc<dyn Sandbox>)
    }

    fn instance(&self) -> Option<Arc<dyn Sandbox>> {
        let booted = *self.booted.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        booted.then(|| self.sandbox.clone() as Arc<dyn Sandbox>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_requires_parent_directory() {
        let sandbox = MemorySandbox::new();
        assert!(sandbox.write_file("src/a.js", "x").await.unwrap_err().is_not_found());
        sandbox.mkdir("src").await.unwrap();
        sandbox.write_file("src/a.js", "x").await.unwrap();
        assert_eq!(sandbox.file("src/a.js").as_deref(), Some("x"));
        assert_eq!(sandbox.writes(), vec!["src/a.js"]);
    }

    #[tokio::test]
    async fn test_read_dir_lists_immediate_children() {
        let sandbox = MemorySandbox::new();
        sandbox.modify("src/a.js", "a");
        sandbox.modify("src/lib/b.js", "b");
        sandbox.make_dir("src/empty");

        let entries = sandbox.read_dir("/src").await.unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry { name: "a.js".into(), is_dir: false },
                DirEntry { name: "empty".into(), is_dir: true },
                DirEntry { name: "lib".into(), is_dir: true },
            ]
        );
        assert!(sandbox.read_dir("src/a.js").await.is_err());
        assert!(sandbox.read_dir("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_respects_recursive_flag() {
        let sandbox = MemorySandbox::new();
        sandbox.modify("src/a.js", "a");
        assert!(sandbox.remove("src", false).await.is_err());
        sandbox.remove("src", true).await.unwrap();
        assert!(!sandbox.has_dir("src"));
        assert!(sandbox.remove("src", true).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_watch_sees_writes() {
        let sandbox = MemorySandbox::new();
        let mut events = sandbox.watch().unwrap();
        sandbox.write_file("a.js", "1").await.unwrap();
        sandbox.delete("a.js");
        assert_eq!(
            events.recv().await.unwrap(),
            WatchEvent { kind: WatchKind::Change, path: "/a.js".into() }
        );
        assert_eq!(events.recv().await.unwrap().kind, WatchKind::Rename);
    }

    #[tokio::test]
    async fn test_scripted_process_exits_with_output() {
        let sandbox = MemorySandbox::new();
        sandbox.script("npm install", ProcessScript::exits(0).with_output("added 3 packages\n"));

        let mut process = sandbox
            .spawn("npm", &["install".to_string()], SpawnOptions::default())
            .await
            .unwrap();
        assert_eq!(process.output.recv().await.as_deref(), Some("added 3 packages\n"));
        assert_eq!(process.output.recv().await, None);
        assert_eq!(process.exit.await.unwrap(), Some(0));
        assert!(sandbox.running().is_empty());
    }

    #[tokio::test]
    async fn test_unscripted_process_runs_until_killed() {
        let sandbox = MemorySandbox::new();
        let process = sandbox
            .spawn("node", &["server.js".to_string()], SpawnOptions::default())
            .await
            .unwrap();
        assert_eq!(sandbox.running(), vec![process.id]);
        assert!(sandbox.emit_output(process.id, "listening\n"));

        process.control.kill();
        assert_eq!(process.exit.await.unwrap(), None);
        assert_eq!(sandbox.killed(), vec![process.id]);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let sandbox = MemorySandbox::new();
        sandbox.script("bun", ProcessScript::fails_to_spawn("command not found"));
        let err = sandbox.spawn("bun", &[], SpawnOptions::default()).await.err().unwrap();
        assert!(matches!(err, SandboxError::Spawn { .. }));
        assert_eq!(sandbox.spawned().len(), 1);
    }

    #[tokio::test]
    async fn test_runtime_boots_once() {
        let runtime = MemoryRuntime::new();
        assert!(runtime.instance().is_none());
        runtime.boot().await.unwrap();
        assert!(matches!(runtime.boot().await.err(), Some(SandboxError::AlreadyBooted)));
        assert!(runtime.instance().is_some());
        assert_eq!(runtime.boot_count(), 1);
    }

    #[tokio::test]
    async fn test_teardown_stops_processes() {
        let sandbox = MemorySandbox::new();
        let process = sandbox.spawn("node", &[], SpawnOptions::default()).await.unwrap();
        sandbox.teardown().await;
        assert_eq!(process.exit.await.unwrap(), None);
        assert!(matches!(
            sandbox.read_file("a").await,
            Err(SandboxError::TornDown)
        ));
    }
}
