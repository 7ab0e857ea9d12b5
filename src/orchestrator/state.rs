//! Observable orchestrator state.
//!
//! One [`OrchestratorState`] value is authoritative at a time. It is published
//! on a `watch` channel: observers read or await it, and only the orchestrator
//! and its supervisors can change it through a [`StateHandle`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle of the development environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Nothing booted yet
    #[default]
    Idle,
    /// Sandbox runtime is being created
    Booting,
    /// Project files are being written into the sandbox
    Mounting,
    /// Dependency install is running
    Installing,
    /// Dev server spawned, waiting for it to listen
    Starting,
    /// Dev server is reachable
    Ready,
    /// Dev server exited cleanly
    Stopped,
    /// Fatal fault; needs new input or a restart
    Error,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Booting => "booting",
            Self::Mounting => "mounting",
            Self::Installing => "installing",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Whether a sandbox exists in this state.
    pub fn is_booted(&self) -> bool {
        !matches!(self, Self::Idle | Self::Booting)
    }

    /// Whether work is in progress that will move the state on by itself.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Booting | Self::Mounting | Self::Installing | Self::Starting
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub lifecycle: LifecycleState,
    /// Preview URL of the running dev server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Last error surfaced to the UI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Mobile preview URI scraped from dev-server output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_preview_url: Option<String>,
    /// Exit code of the last dev-server process that ended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    pub changed_at: DateTime<Utc>,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleState::Idle,
            url: None,
            port: None,
            error: None,
            mobile_preview_url: None,
            last_exit_code: None,
            changed_at: Utc::now(),
        }
    }
}

/// Write side of the state channel.
#[derive(Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<OrchestratorState>>,
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(OrchestratorState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> OrchestratorState {
        self.tx.borrow().clone()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.tx.borrow().lifecycle
    }

    /// Apply `change` and notify observers.
    pub fn update(&self, change: impl FnOnce(&mut OrchestratorState)) {
        self.tx.send_modify(|state| {
            let before = state.lifecycle;
            change(state);
            state.changed_at = Utc::now();
            if before != state.lifecycle {
                tracing::debug!(from = %before, to = %state.lifecycle, "lifecycle transition");
            }
        });
    }

    pub fn set_lifecycle(&self, lifecycle: LifecycleState) {
        self.update(|state| state.lifecycle = lifecycle);
    }

    /// Enter [`LifecycleState::Error`] with a message.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|state| {
            state.lifecycle = LifecycleState::Error;
            state.error = Some(message);
        });
    }
}
