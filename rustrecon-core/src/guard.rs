use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Skip-if-busy guard for background jobs that must not overlap.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    lock: Arc<Mutex<()>>,
}

/// Held while the job runs; dropping it lets the next caller in.
pub type FlightGuard = OwnedMutexGuard<()>;

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter without waiting. `None` when another holder is active.
    pub fn try_enter(&self) -> Option<FlightGuard> {
        Arc::clone(&self.lock).try_lock_owned().ok()
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}
