//! Process-wide counters reported by `service:health`

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Service state shared across connections
pub struct ServiceState {
    /// Server start time
    pub start_time: Instant,
    /// Commands dispatched since start
    pub commands_handled: AtomicU64,
}

impl ServiceState {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            commands_handled: AtomicU64::new(0),
        }
    }

    /// Increment command counter, returning the previous value
    pub fn increment_commands(&self) -> u64 {
        self.commands_handled.fetch_add(1, Ordering::SeqCst)
    }

    pub fn commands_handled(&self) -> u64 {
        self.commands_handled.load(Ordering::SeqCst)
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::new()
    }
}
