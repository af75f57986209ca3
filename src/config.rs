//! Engine configuration.

use std::time::Duration;

use crate::blacklist::BlacklistConfig;

/// Default per-command acknowledgement timeout for cache-hit copies.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Default delay between a terminal transition and actor shutdown, leaving a
/// window for final queries (failure message, store snapshot).
pub const DEFAULT_TERMINATE_DELAY: Duration = Duration::from_millis(500);

/// Engine-wide configuration shared by every workflow actor in the process.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-command timeout while waiting for I/O acknowledgements.
    pub io_timeout: Duration,
    /// Delay before a terminal workflow actor stops itself.
    pub terminate_delay: Duration,
    /// Upper bound on concurrently running call runners per workflow.
    pub max_concurrent_calls: usize,
    pub blacklist: BlacklistConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            io_timeout: DEFAULT_IO_TIMEOUT,
            terminate_delay: DEFAULT_TERMINATE_DELAY,
            max_concurrent_calls: num_cpus::get().max(1) * 2,
            blacklist: BlacklistConfig::default(),
        }
    }
}
