use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Admits any number of concurrent operations until shutdown starts, then
/// admits none and lets shutdown wait for the admitted ones to finish.
#[derive(Debug)]
pub struct ShutdownGuard {
    draining: Mutex<bool>,
    active: watch::Sender<usize>,
}

/// An admitted operation. Dropping it lets shutdown proceed.
#[derive(Debug)]
#[must_use]
pub struct ShutdownPermit<'a> {
    guard: &'a ShutdownGuard,
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownGuard {
    /// Creates a guard admitting operations.
    #[must_use]
    pub fn new() -> Self {
        Self {
            draining: Mutex::new(false),
            active: watch::Sender::new(0),
        }
    }

    /// Admits an operation, or returns `None` once shutdown has started.
    pub fn try_acquire(&self) -> Option<ShutdownPermit<'_>> {
        let draining = self.draining.lock();

        if *draining {
            return None;
        }

        self.active.send_modify(|active| *active += 1);

        Some(ShutdownPermit { guard: self })
    }

    /// Stops admitting operations and waits until every admitted one has
    /// finished.
    pub async fn drain(&self) {
        *self.draining.lock() = true;

        let mut active = self.active.subscribe();
        debug!(active = *active.borrow(), "draining");

        let _ = active.wait_for(|active| *active == 0).await;
    }

    /// Whether shutdown has started.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        *self.draining.lock()
    }

    /// Number of admitted operations still running.
    #[must_use]
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }
}

impl Drop for ShutdownPermit<'_> {
    fn drop(&mut self) {
        self.guard.active.send_modify(|active| *active -= 1);
    }
}
