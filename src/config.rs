use crate::core::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How batch dispatch walks its targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One target after the other, in target order.
    #[default]
    Sequential,
    /// All targets resolved and invoked concurrently within the request task.
    Concurrent,
}

/// Object server configuration
///
/// Every field has a default, so a JSON document only needs the keys it
/// wants to override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Name of this server instance, attached to routing decisions and logs.
    pub server_id: String,

    /// Upper bound for a single durability load, in milliseconds.
    pub load_timeout_ms: Option<u64>,

    /// Upper bound for the commit at the end of a request, in milliseconds.
    pub commit_timeout_ms: Option<u64>,

    pub dispatch_mode: DispatchMode,

    /// Batches with more targets than this are refused.
    pub max_dispatch_targets: usize,

    /// A request marking more objects dirty than this logs a warning.
    pub dirty_warn_threshold: usize,

    /// Emit a debug event for every cache hit and miss.
    pub log_cache_hits: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: "gs01".to_string(),
            load_timeout_ms: Some(5_000),
            commit_timeout_ms: Some(10_000),
            dispatch_mode: DispatchMode::Sequential,
            max_dispatch_targets: 10_000,
            dirty_warn_threshold: 1_000,
            log_cache_hits: true,
        }
    }
}

impl ServerConfig {
    pub fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| CacheError::Config(format!("invalid server config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_id.trim().is_empty() {
            return Err(CacheError::Config("server_id must not be empty".to_string()));
        }
        if self.max_dispatch_targets == 0 {
            return Err(CacheError::Config(
                "max_dispatch_targets must be greater than zero".to_string(),
            ));
        }
        if self.load_timeout_ms == Some(0) || self.commit_timeout_ms == Some(0) {
            return Err(CacheError::Config(
                "durability timeouts must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Set load timeout
    pub fn load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set commit timeout
    pub fn commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Disable durability timeouts entirely
    pub fn without_timeouts(mut self) -> Self {
        self.load_timeout_ms = None;
        self.commit_timeout_ms = None;
        self
    }

    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    pub fn max_dispatch_targets(mut self, max: usize) -> Self {
        self.max_dispatch_targets = max;
        self
    }

    pub fn dirty_warn_threshold(mut self, threshold: usize) -> Self {
        self.dirty_warn_threshold = threshold;
        self
    }

    pub fn log_cache_hits(mut self, enabled: bool) -> Self {
        self.log_cache_hits = enabled;
        self
    }

    pub fn load_timeout_duration(&self) -> Option<Duration> {
        self.load_timeout_ms.map(Duration::from_millis)
    }

    pub fn commit_timeout_duration(&self) -> Option<Duration> {
        self.commit_timeout_ms.map(Duration::from_millis)
    }
}
