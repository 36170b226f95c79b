use crate::constants::{DEFAULT_ATTEMPTS, DEFAULT_BACKOFF, DEFAULT_IDLE_TIMEOUT};
use crate::error::{ChihirosError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for a [`ConnectionEngine`](crate::engine::ConnectionEngine).
///
/// Loadable from JSON; missing fields take their defaults:
///
/// ```json
/// { "attempts": 3, "backoff_ms": 250, "idle_timeout_secs": 120, "write_with_response": false }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Write attempts per `send_command`, including the first
    pub attempts: u32,
    pub backoff_ms: u64,
    /// Zero disables the idle disconnect
    pub idle_timeout_secs: u64,
    pub write_with_response: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff_ms: DEFAULT_BACKOFF.as_millis() as u64,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            write_with_response: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config.validate()
    }

    pub fn validate(self) -> Result<Self> {
        if self.attempts == 0 {
            return Err(ChihirosError::InvalidParameter("attempts must be at least 1".to_string()));
        }
        Ok(self)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}
