use std::time::Instant;

use crate::config::ServerConfig;
use crate::recorder::Recorder;

/// Main server state shared across all handlers
pub struct ServerState {
    pub config: ServerConfig,
    pub recorder: Recorder,
    pub start_time: Instant,
}

impl ServerState {
    pub fn new(config: ServerConfig, recorder: Recorder) -> Self {
        Self {
            config,
            recorder,
            start_time: Instant::now(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
