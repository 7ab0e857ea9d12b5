//! Terminal sink adapter.
//!
//! Subprocess output and orchestrator status lines are written here before any
//! display surface exists. Text is buffered until a [`TerminalSurface`] is
//! attached, flushed to it once, and then passed straight through. Writing
//! never fails from the caller's point of view.

use console::style;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A display surface that renders terminal text (an xterm widget, stdout, ...).
pub trait TerminalSurface: Send + Sync {
    /// Render `text`. An error means the surface is not ready yet; the text is
    /// kept and retried on the next flush.
    fn write(&self, text: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
struct SinkState {
    surface: Option<Arc<dyn TerminalSurface>>,
    pending: String,
    /// Whether the last chunk written ended in `\r`.
    trailing_cr: bool,
}

/// Cloneable handle to the shared terminal sink.
#[derive(Clone, Default)]
pub struct Terminal {
    state: Arc<Mutex<SinkState>>,
}

impl Terminal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        // A panic while holding the lock can't leave the buffer half-written,
        // so keep using the state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write raw text. Bare `\n` becomes `\r\n` so terminal emulators return to
    /// column zero. Anything still buffered goes out ahead of `text`.
    pub fn write(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut state = self.lock();
        let normalized = normalize_newlines(text, state.trailing_cr);
        state.trailing_cr = text.ends_with('\r');
        let Some(surface) = state.surface.clone() else {
            state.pending.push_str(&normalized);
            return;
        };
        if state.pending.is_empty() {
            if surface.write(&normalized).is_ok() {
                return;
            }
            state.pending.push_str(&normalized);
        } else {
            state.pending.push_str(&normalized);
            if surface.write(&state.pending).is_ok() {
                state.pending.clear();
                return;
            }
        }
        tracing::debug!("terminal surface rejected write, buffering");
    }

    /// Write a line terminated with a newline.
    pub fn line(&self, text: &str) {
        self.write(&format!("{}\n", text));
    }

    pub fn info(&self, text: &str) {
        self.line(&style(text).cyan().to_string());
    }

    pub fn warn(&self, text: &str) {
        self.line(&style(text).yellow().to_string());
    }

    pub fn error(&self, text: &str) {
        self.line(&style(text).red().to_string());
    }

    /// Attach a display surface and deliver everything buffered so far.
    pub fn attach(&self, surface: Arc<dyn TerminalSurface>) {
        self.lock().surface = Some(surface);
        self.flush();
    }

    /// Detach the current surface; later writes buffer again.
    pub fn detach(&self) {
        self.lock().surface = None;
    }

    pub fn is_attached(&self) -> bool {
        self.lock().surface.is_some()
    }

    /// Try to deliver buffered text. Returns `true` when nothing is pending.
    pub fn flush(&self) -> bool {
        let mut state = self.lock();
        if state.pending.is_empty() {
            return true;
        }
        let Some(surface) = state.surface.clone() else {
            return false;
        };
        match surface.write(&state.pending) {
            Ok(()) => {
                state.pending.clear();
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "terminal flush deferred");
                false
            }
        }
    }

    /// Text written but not yet delivered to a surface.
    pub fn pending(&self) -> String {
        self.lock().pending.clone()
    }

    /// Spawn a best-effort periodic flush. The task stops once a flush drains
    /// the buffer with a surface attached; dropping the handle does not stop it,
    /// abort it for that.
    pub fn spawn_flusher(&self, interval: Duration) -> JoinHandle<()> {
        let terminal = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if terminal.is_attached() && terminal.flush() {
                    break;
                }
            }
        })
    }
}

/// `after_cr` says the previous chunk ended in `\r`, so a leading `\n` is
/// already part of a `\r\n` pair.
fn normalize_newlines(text: &str, after_cr: bool) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut prev = if after_cr { '\r' } else { '\0' };
    for ch in text.chars() {
        if ch == '\n' && prev != '\r' {
            out.push('\r');
        }
        out.push(ch);
        prev = ch;
    }
    out
}

/// Surface that writes to the process's stdout.
pub struct StdoutSurface;

impl TerminalSurface for StdoutSurface {
    fn write(&self, text: &str) -> anyhow::Result<()> {
        use std::io::Write;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(text.as_bytes())?;
        stdout.flush()?;
        Ok(())
    }
}

/// Surface that records everything written to it.
#[derive(Default)]
pub struct CaptureSurface {
    text: Mutex<String>,
}

impl CaptureSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn contents(&self) -> String {
        self.text
            .lock()
            .map(|t| t.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl TerminalSurface for CaptureSurface {
    fn write(&self, text: &str) -> anyhow::Result<()> {
        self.text
            .lock()
            .map_err(|_| anyhow::anyhow!("capture surface lock poisoned"))?
            .push_str(text);
        Ok(())
    }
}
