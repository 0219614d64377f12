use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{BridgeError, ExecutionState};

/// Process-wide tuning for the bridge. Every field has a default so partial
/// JSON files are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Worker pool threads, fixed for the life of the pool.
    pub worker_threads: usize,
    /// Pending tasks the worker pool holds before `post` starts rejecting.
    pub task_queue_capacity: usize,
    /// How long a worker waits on its queue before re-checking the shutdown flag.
    pub task_poll_interval_ms: u64,
    /// Closures a node's execution queue holds between two ticks.
    pub exec_queue_capacity: usize,
    /// Spent closures the audio thread can hand back before the next UI refresh.
    pub garbage_capacity: usize,
    /// Period of the coarse UI refresh timer.
    pub ui_refresh_interval_ms: u64,
    /// Bytes buffered per direction on a node's message bus.
    pub message_bus_capacity: usize,
    /// Audio configuration assumed until the host reports its own.
    pub audio: ExecutionState,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            task_queue_capacity: 1024,
            task_poll_interval_ms: 100,
            exec_queue_capacity: 512,
            garbage_capacity: 1024,
            ui_refresh_interval_ms: 16,
            message_bus_capacity: 64 * 1024,
            audio: ExecutionState::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, BridgeError> {
        let config: Self = serde_json::from_str(json).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, BridgeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.worker_threads == 0 {
            return Err(BridgeError::Config("worker_threads must be at least 1".into()));
        }
        if self.task_queue_capacity == 0 || self.exec_queue_capacity == 0 || self.garbage_capacity == 0 {
            return Err(BridgeError::Config("queue capacities must be non-zero".into()));
        }
        if self.audio.sample_rate <= 0.0 || self.audio.buffer_size == 0 || self.audio.channels == 0 {
            return Err(BridgeError::Config("audio configuration must be positive".into()));
        }
        Ok(())
    }

    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms)
    }

    pub fn ui_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.ui_refresh_interval_ms)
    }
}
