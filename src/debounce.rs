//! Trailing-edge debouncer.
//!
//! [`Debouncer::trigger`] (re)arms a single timer; the action runs once the
//! timer expires with no further triggers. Actions never overlap and are
//! never cancelled midway: triggers that arrive while an action runs arm the
//! timer again for one follow-up run.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl Debouncer {
    /// Spawn the timer task. `action` is called once per quiet period.
    pub fn spawn<F>(delay: Duration, action: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let task = tokio::spawn(async move {
            // Wait for the first trigger of a burst.
            while rx.recv().await.is_some() {
                loop {
                    tokio::select! {
                        more = rx.recv() => {
                            if more.is_none() {
                                // Sender gone: run what is pending, then stop.
                                action().await;
                                return;
                            }
                        }
                        _ = tokio::time::sleep(delay) => break,
                    }
                }
                action().await;
            }
        });
        Self { tx, task }
    }

    /// Arm or re-arm the timer.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// A cloneable handle that arms this debouncer from another task.
    pub fn trigger_handle(&self) -> Trigger {
        Trigger {
            tx: self.tx.clone(),
        }
    }

    /// Stop the timer task without running pending work.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

#[derive(Clone)]
pub struct Trigger {
    tx: mpsc::UnboundedSender<()>,
}

impl Trigger {
    pub fn fire(&self) {
        let _ = self.tx.send(());
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
