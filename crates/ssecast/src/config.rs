//! Server configuration.

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Payload bytes taken from the control channel per ingest.
pub const DEFAULT_READ_CAPACITY: usize = 1024;

/// Configuration for one server instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind, numeric or a name for the system resolver (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum payload bytes taken from the control channel per ingest.
    /// Longer writes are truncated to this many bytes.
    pub read_capacity: usize,
    /// Readiness events returned per wait.
    pub event_capacity: usize,
    /// Scratch buffer for draining (and discarding) subscriber input.
    pub client_read_buffer: usize,
}

impl ServerConfig {
    /// Config for `host:port` with every other field at its default.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Reject values the reactor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue("host must not be empty".into()));
        }
        if self.read_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "read_capacity must be greater than zero".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "event_capacity must be greater than zero".into(),
            ));
        }
        if self.client_read_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "client_read_buffer must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            read_capacity: DEFAULT_READ_CAPACITY,
            event_capacity: 128,
            client_read_buffer: 1024,
        }
    }
}
