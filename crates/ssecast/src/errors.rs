//! Error types for server setup, the event loop, configuration and the
//! subscriber handshake.
//!
//! Failures that only affect a single subscriber are not errors at this
//! level: the reactor logs them and removes the client.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Fatal failure while bringing up a server instance.
///
/// Returned before any [`ControlHandle`](crate::ControlHandle) exists, so no
/// partial server state is left running.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The system resolver rejected the address.
    #[error("failed to resolve {address}: {source}")]
    Resolve {
        /// Address as given by the caller.
        address: String,
        /// Resolver error.
        #[source]
        source: io::Error,
    },

    /// The resolver returned no addresses.
    #[error("{0} did not resolve to any socket address")]
    NoAddress(String),

    /// Bind or listen failed.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: SocketAddr,
        /// Socket error.
        #[source]
        source: io::Error,
    },

    /// The bound listener could not report its local address.
    #[error("failed to read listener address: {0}")]
    LocalAddr(#[source] io::Error),

    /// The control pipe could not be created or configured.
    #[error("failed to create control channel: {0}")]
    ControlChannel(#[source] io::Error),

    /// The readiness poller could not be created.
    #[error("failed to create poller: {0}")]
    Poller(#[source] io::Error),

    /// A descriptor could not be registered with the poller.
    #[error("failed to register {what} with poller: {source}")]
    Register {
        /// Which descriptor.
        what: &'static str,
        /// Poller error.
        #[source]
        source: io::Error,
    },

    /// The worker thread or process could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    /// The worker process exited or closed stdout before reporting its address.
    #[error("worker exited before reporting readiness")]
    WorkerNotReady,

    /// The worker process printed something other than a readiness line.
    #[error("unexpected readiness line from worker: {0:?}")]
    BadReadyLine(String),

    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Fatal failure inside a running event loop.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// The readiness wait failed with something other than `EINTR`.
    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),

    /// The worker thread panicked.
    #[error("worker thread panicked")]
    WorkerPanicked,
}

/// Configuration loading or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
    /// Failed to parse JSON in the config file.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A value was out of range.
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// The fixed SSE header could not be delivered whole.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The write failed outright.
    #[error("handshake write failed: {0}")]
    Io(#[from] io::Error),
    /// The socket accepted only part of the header.
    #[error("handshake short write: {written} of {expected} bytes")]
    Short {
        /// Bytes accepted by the socket.
        written: usize,
        /// Header length.
        expected: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_display_includes_address() {
        let err = SetupError::Bind {
            addr: "127.0.0.1:9000".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:9000"));
        assert!(msg.contains("in use"));
    }

    #[test]
    fn config_error_converts_into_setup_error() {
        let err: SetupError = ConfigError::InvalidValue("read_capacity must be > 0".into()).into();
        assert!(matches!(err, SetupError::Config(_)));
        assert_eq!(
            err.to_string(),
            "invalid config value: read_capacity must be > 0"
        );
    }

    #[test]
    fn json_error_display() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err = ConfigError::Json(json_err);
        assert!(err.to_string().contains("parse config JSON"));
    }

    #[test]
    fn short_handshake_display() {
        let err = HandshakeError::Short {
            written: 10,
            expected: 78,
        };
        assert_eq!(err.to_string(), "handshake short write: 10 of 78 bytes");
    }

    #[test]
    fn wait_error_keeps_source() {
        use std::error::Error as _;
        let err = ReactorError::Wait(io::Error::other("boom"));
        assert!(err.source().is_some());
    }
}
