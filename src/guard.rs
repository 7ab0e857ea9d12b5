//! In-flight flags that keep long-running operations from interleaving.
//!
//! Each flag is checked-and-set atomically; the returned [`FlagGuard`] resets
//! it when dropped, so an early return or error never leaves a flag stuck.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A shareable boolean "operation in progress" flag.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    flag: Arc<AtomicBool>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag if it is clear. Returns `None` when another operation
    /// already holds it.
    pub fn try_acquire(&self) -> Option<FlagGuard> {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlagGuard {
                flag: Arc::clone(&self.flag),
                armed: true,
            })
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Clear the flag regardless of who holds it.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Clears its [`InFlight`] flag on drop unless released with [`FlagGuard::keep`].
#[derive(Debug)]
pub struct FlagGuard {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl FlagGuard {
    /// Leave the flag set after this guard is dropped. Something else is then
    /// responsible for calling [`InFlight::clear`].
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for FlagGuard {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(false, Ordering::Release);
        }
    }
}
