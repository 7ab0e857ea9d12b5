//! Lifecycle tests for the orchestrator.
//!
//! Everything runs against the in-memory sandbox runtime and store, so tests
//! drive process exits and `server-ready` notifications by hand.

use std::sync::Arc;
use std::time::Duration;

use devenv::devserver::StartOutcome;
use devenv::install::InstallOutcome;
use devenv::manifest::DependencyDecision;
use devenv::sandbox::memory::{MemoryRuntime, MemorySandbox, ProcessScript};
use devenv::store::MemoryStore;
use devenv::terminal::{CaptureSurface, Terminal};
use devenv::{
    DevenvConfig, FileMap, LifecycleState, Orchestrator, OrchestratorError, OrchestratorState,
    SyncMode, SyncOutcome,
};

const DEV_MANIFEST: &str = r#"{"scripts":{"dev":"node server.js"}}"#;
const SERVER_JS: &str = "require('http').createServer().listen(process.env.PORT)";

fn files(entries: &[(&str, &str)]) -> FileMap {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

struct Harness {
    runtime: Arc<MemoryRuntime>,
    store: Arc<MemoryStore>,
    terminal: Terminal,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(DevenvConfig::default())
    }

    fn with_config(config: DevenvConfig) -> Self {
        let runtime = Arc::new(MemoryRuntime::new());
        runtime
            .sandbox()
            .script("npm install", ProcessScript::exits(0).with_output("added 1 package\n"));
        let store = Arc::new(MemoryStore::new(FileMap::new()));
        let terminal = Terminal::new();
        let orchestrator =
            Orchestrator::new(config, runtime.clone(), store.clone(), terminal.clone());
        Self {
            runtime,
            store,
            terminal,
            orchestrator,
        }
    }

    fn sandbox(&self) -> Arc<MemorySandbox> {
        self.runtime.sandbox()
    }

    async fn sync(&self, desired: FileMap) -> devenv::orchestrator::SyncReport {
        match self.orchestrator.sync(desired, SyncMode::Settled).await {
            Ok(SyncOutcome::Applied(report)) => report,
            other => panic!("expected applied sync, got {:?}", other),
        }
    }

    async fn wait_for(&self, predicate: impl FnMut(&OrchestratorState) -> bool) -> OrchestratorState {
        let mut rx = self.orchestrator.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
        state.clone()
    }

    fn commands(&self) -> Vec<String> {
        self.sandbox()
            .spawned()
            .iter()
            .map(|s| s.command_line())
            .collect()
    }

    fn dev_server_id(&self) -> u64 {
        self.sandbox()
            .spawned()
            .iter()
            .rev()
            .find(|s| s.command_line().starts_with("npm run dev"))
            .map(|s| s.id)
            .expect("no dev server spawned")
    }
}

// =============================================================================
// End-to-end scenarios
// =============================================================================

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn test_first_sync_mounts_installs_starts_and_becomes_ready() {
        let h = Harness::new();
        let report = h
            .sync(files(&[("package.json", DEV_MANIFEST), ("server.js", SERVER_JS)]))
            .await;

        assert_eq!(h.sandbox().mount_count(), 1);
        assert_eq!(report.install, Some(InstallOutcome::Succeeded));
        assert!(matches!(report.start, Some(StartOutcome::Started { .. })));
        assert_eq!(h.commands(), vec!["npm install", "npm run dev"]);
        assert_eq!(h.orchestrator.state().lifecycle, LifecycleState::Starting);

        h.sandbox().emit_server_ready(3000, "http://host:3000");
        let state = h.wait_for(|s| s.lifecycle == LifecycleState::Ready).await;
        assert_eq!(state.url.as_deref(), Some("http://host:3000"));
        assert_eq!(state.port, Some(3000));
    }

    #[tokio::test]
    async fn test_source_edit_writes_one_file_without_reinstall_or_restart() {
        let h = Harness::new();
        h.sync(files(&[("package.json", DEV_MANIFEST), ("server.js", SERVER_JS)]))
            .await;
        h.sandbox().emit_server_ready(3000, "http://host:3000");
        h.wait_for(|s| s.lifecycle == LifecycleState::Ready).await;
        h.sandbox().clear_records();

        let report = h
            .sync(files(&[
                ("package.json", DEV_MANIFEST),
                ("server.js", "// edited\n"),
            ]))
            .await;

        assert_eq!(report.reconcile.written, vec!["server.js"]);
        assert_eq!(h.sandbox().writes(), vec!["server.js"]);
        assert_eq!(report.dependencies, DependencyDecision::Unchanged);
        assert!(report.install.is_none());
        assert!(report.start.is_none());
        assert_eq!(h.commands().len(), 2);
        assert!(h.sandbox().killed().is_empty());
        assert_eq!(h.orchestrator.state().lifecycle, LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_dependency_change_reinstalls_and_restarts() {
        let h = Harness::new();
        h.sync(files(&[("package.json", DEV_MANIFEST), ("server.js", SERVER_JS)]))
            .await;
        let first_dev = h.dev_server_id();

        let with_deps = r#"{"scripts":{"dev":"node server.js"},"dependencies":{"express":"^4.18.0"}}"#;
        let report = h
            .sync(files(&[("package.json", with_deps), ("server.js", SERVER_JS)]))
            .await;

        assert_eq!(report.dependencies, DependencyDecision::Changed);
        assert_eq!(report.install, Some(InstallOutcome::Succeeded));
        assert!(matches!(report.start, Some(StartOutcome::Started { .. })));
        assert_eq!(
            h.commands(),
            vec!["npm install", "npm run dev", "npm install", "npm run dev"]
        );
        assert_eq!(h.sandbox().killed(), vec![first_dev]);
        assert_eq!(h.sandbox().running(), vec![h.dev_server_id()]);
    }

    #[tokio::test]
    async fn test_crash_then_new_input_starts_fresh() {
        let h = Harness::new();
        h.sync(files(&[("package.json", DEV_MANIFEST), ("server.js", SERVER_JS)]))
            .await;
        h.sandbox().exit_process(h.dev_server_id(), Some(1));
        h.wait_for(|s| s.last_exit_code == Some(1)).await;

        let report = h
            .sync(files(&[
                ("package.json", DEV_MANIFEST),
                ("server.js", "// fixed\n"),
            ]))
            .await;
        assert!(report.install.is_none());
        assert!(matches!(report.start, Some(StartOutcome::Started { .. })));
        assert_eq!(h.sandbox().running().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_buffers_until_surface_attaches() {
        let h = Harness::new();
        h.sync(files(&[("package.json", DEV_MANIFEST), ("server.js", SERVER_JS)]))
            .await;
        assert!(h.terminal.pending().contains("added 1 package"));

        let surface = CaptureSurface::new();
        h.terminal.attach(surface.clone());
        assert!(h.terminal.pending().is_empty());
        assert!(surface.contents().contains("$ npm install"));
        assert!(surface.contents().contains("$ npm run dev"));
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

mod reconciliation {
    use super::*;

    #[tokio::test]
    async fn test_same_desired_set_twice_writes_nothing() {
        let h = Harness::new();
        let desired = files(&[
            ("package.json", DEV_MANIFEST),
            ("server.js", SERVER_JS),
            ("src/lib/util.js", "export {}"),
        ]);
        h.sync(desired.clone()).await;
        h.sandbox().clear_records();

        let report = h.sync(desired).await;
        assert!(report.reconcile.is_noop());
        assert!(h.sandbox().writes().is_empty());
        assert!(h.sandbox().removals().is_empty());
        assert_eq!(h.sandbox().mount_count(), 1);
    }

    #[tokio::test]
    async fn test_removed_path_is_deleted_from_sandbox_and_mirror() {
        let h = Harness::new();
        h.sync(files(&[("index.js", "main"), ("old.js", "stale")]))
            .await;
        h.sandbox().clear_records();

        let report = h.sync(files(&[("index.js", "main")])).await;
        assert_eq!(report.reconcile.deleted, vec!["old.js"]);
        assert_eq!(h.sandbox().removals(), vec!["old.js"]);
        assert!(h.sandbox().file("old.js").is_none());
        assert!(!h.orchestrator.mounted_files().contains_key("old.js"));
    }

    #[tokio::test]
    async fn test_unchanged_dependencies_do_not_reinstall() {
        let h = Harness::new();
        let v1 = r#"{"name":"app","dependencies":{"react":"18.2.0"},"scripts":{"dev":"vite"}}"#;
        let v2 = r#"{"name":"app","version":"1.0.1","dependencies":{"react":"18.2.0"},"scripts":{"dev":"vite --host"}}"#;
        h.sync(files(&[("package.json", v1)])).await;
        let report = h.sync(files(&[("package.json", v2)])).await;

        assert_eq!(report.reconcile.written, vec!["package.json"]);
        assert_eq!(report.dependencies, DependencyDecision::Unchanged);
        assert!(report.install.is_none());
        let installs = h
            .commands()
            .into_iter()
            .filter(|c| c == "npm install")
            .count();
        assert_eq!(installs, 1);
    }

    #[tokio::test]
    async fn test_unsupported_script_flags_are_stripped_in_sandbox_only() {
        let h = Harness::new();
        let manifest = r#"{"scripts":{"dev":"next dev --turbopack"}}"#;
        h.sync(files(&[("package.json", manifest)])).await;

        let mounted = h.sandbox().file("package.json").unwrap();
        assert!(mounted.contains("\"next dev\""));
        assert_eq!(
            h.orchestrator.mounted_files().get("package.json").map(String::as_str),
            Some(manifest)
        );
    }

    #[tokio::test]
    async fn test_ignored_paths_are_never_mounted() {
        let h = Harness::new();
        h.sync(files(&[
            ("index.js", "main"),
            ("node_modules/react/index.js", "vendored"),
            (".git/HEAD", "ref: refs/heads/main"),
        ]))
        .await;
        assert!(h.sandbox().file("node_modules/react/index.js").is_none());
        assert!(h.sandbox().file(".git/HEAD").is_none());
        assert_eq!(h.orchestrator.mounted_files().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_manifest_halts_until_fixed() {
        let h = Harness::new();
        let err = h
            .orchestrator
            .sync(files(&[("package.json", "{\"scripts\": {")]), SyncMode::Settled)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Manifest(_)));
        assert_eq!(h.orchestrator.state().lifecycle, LifecycleState::Error);
        assert!(h.commands().is_empty());

        let report = h
            .sync(files(&[("package.json", DEV_MANIFEST), ("server.js", SERVER_JS)]))
            .await;
        assert_eq!(report.install, Some(InstallOutcome::Succeeded));
        assert!(matches!(report.start, Some(StartOutcome::Started { .. })));
        assert_eq!(h.orchestrator.state().error, None);
    }

    #[tokio::test]
    async fn test_streaming_input_waits_for_settle() {
        let h = Harness::new();
        let outcome = h
            .orchestrator
            .sync(files(&[("package.json", "{\"depend")]), SyncMode::Streaming)
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Deferred));
        assert_eq!(h.orchestrator.state().lifecycle, LifecycleState::Idle);

        h.orchestrator
            .sync(
                files(&[("package.json", DEV_MANIFEST), ("server.js", SERVER_JS)]),
                SyncMode::Streaming,
            )
            .await
            .unwrap();
        let outcome = h.orchestrator.settle().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Applied(_)));
        assert_eq!(h.commands(), vec!["npm install", "npm run dev"]);
    }
}

// =============================================================================
// Dev server supervision
// =============================================================================

mod supervision {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_restarts_leave_one_server() {
        let h = Harness::new();
        h.sync(files(&[("package.json", DEV_MANIFEST), ("server.js", SERVER_JS)]))
            .await;

        let (a, b) = tokio::join!(
            h.orchestrator.restart_dev_server(),
            h.orchestrator.restart_dev_server()
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(h.sandbox().running().len(), 1);
    }

    #[tokio::test]
    async fn test_crash_keeps_preview_and_is_not_fatal() {
        let h = Harness::new();
        h.sync(files(&[("package.json", DEV_MANIFEST), ("server.js", SERVER_JS)]))
            .await;
        h.sandbox().emit_server_ready(3000, "http://host:3000");
        h.wait_for(|s| s.lifecycle == LifecycleState::Ready).await;

        h.sandbox().exit_process(h.dev_server_id(), Some(137));
        let state = h.wait_for(|s| s.last_exit_code == Some(137)).await;
        assert_ne!(state.lifecycle, LifecycleState::Error);
        assert_eq!(state.url.as_deref(), Some("http://host:3000"));
        assert_eq!(state.port, Some(3000));
        assert!(h.terminal.pending().contains("exited with code 137"));
    }

    #[tokio::test]
    async fn test_clean_exit_is_stopped() {
        let h = Harness::new();
        h.sync(files(&[("package.json", DEV_MANIFEST), ("server.js", SERVER_JS)]))
            .await;
        h.sandbox().emit_server_ready(3000, "http://host:3000");
        h.wait_for(|s| s.lifecycle == LifecycleState::Ready).await;

        h.sandbox().exit_process(h.dev_server_id(), Some(0));
        let state = h.wait_for(|s| s.lifecycle == LifecycleState::Stopped).await;
        assert_eq!(state.url, None);
    }

    #[tokio::test]
    async fn test_force_ready_overrides_missing_notification() {
        let h = Harness::new();
        h.sync(files(&[("package.json", DEV_MANIFEST), ("server.js", SERVER_JS)]))
            .await;
        assert!(h.orchestrator.force_ready());
        let state = h.wait_for(|s| s.lifecycle == LifecycleState::Ready).await;
        assert_eq!(state.url.as_deref(), Some("http://localhost:3000"));
    }

    #[tokio::test]
    async fn test_install_failure_blocks_start() {
        let h = Harness::new();
        h.sandbox()
            .script("npm install", ProcessScript::exits(1).with_output("ERR! 404\n"));
        let report = h
            .sync(files(&[("package.json", DEV_MANIFEST), ("server.js", SERVER_JS)]))
            .await;
        assert_eq!(report.install, Some(InstallOutcome::Failed { code: Some(1) }));
        assert!(report.start.is_none());
        assert_eq!(h.commands(), vec!["npm install"]);
        assert_ne!(h.orchestrator.state().lifecycle, LifecycleState::Error);
    }

    #[tokio::test]
    async fn test_stop_kills_processes_and_releases_sandbox() {
        let h = Harness::new();
        h.sync(files(&[("package.json", DEV_MANIFEST), ("server.js", SERVER_JS)]))
            .await;
        assert_eq!(h.sandbox().running().len(), 1);

        h.orchestrator.stop().await;
        assert!(h.sandbox().running().is_empty());
        assert_eq!(h.orchestrator.state().lifecycle, LifecycleState::Idle);
        assert!(matches!(
            h.orchestrator.restart_dev_server().await,
            Err(OrchestratorError::Stopped)
        ));
    }
}

// =============================================================================
// Reverse sync
// =============================================================================

mod reverse_sync {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_sandbox_writes_is_one_store_update() {
        let h = Harness::new();
        h.sync(files(&[("index.js", "v0")])).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.store.update_count(), 0);

        for i in 1..=10 {
            h.sandbox().modify("index.js", &format!("v{}", i));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(h.store.update_count(), 1);
        assert_eq!(
            h.store.files().get("index.js").map(String::as_str),
            Some("v10")
        );
        assert_eq!(
            h.orchestrator.mounted_files().get("index.js").map(String::as_str),
            Some("v10")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_artifacts_stay_in_sandbox() {
        let h = Harness::new();
        h.sync(files(&[("index.js", "v0")])).await;
        h.sandbox().modify(".next/cache/webpack.pack", "binary-ish");
        h.sandbox().modify("node_modules/.package-lock.json", "{}");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.store.update_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sandbox_deletion_reaches_store() {
        let h = Harness::new();
        let desired = files(&[("index.js", "main"), ("tmp.js", "scratch")]);
        h.store.set_files(desired.clone());
        h.sync(desired).await;

        h.sandbox().delete("tmp.js");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.store.update_count(), 1);
        assert!(!h.store.files().contains_key("tmp.js"));
        assert!(!h.orchestrator.mounted_files().contains_key("tmp.js"));
    }
}
