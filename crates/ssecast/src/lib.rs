//! # ssecast
//!
//! Single-threaded Server-Sent-Events broadcast server driven by a control pipe.
//!
//! - Readiness-based reactor (`mio`) owning the listener, the subscribers and the control channel
//! - Fixed SSE header on connect, then `data: <payload>\n\n` frames
//! - One outbound message at a time; a newer one overwrites it for every client that has not flushed yet
//! - Thread mode ([`start`]) and process mode ([`spawn_worker`]) supervisors
//! - Config layering (defaults, JSON file, `SSECAST_*` env vars)

#![deny(unsafe_code)]

pub mod broadcaster;
pub mod config;
pub mod control;
pub mod errors;
pub mod handshake;
pub mod listener;
pub mod loader;
pub mod logging;
pub mod metrics;
pub mod reactor;
pub mod registry;
pub mod supervisor;

pub use broadcaster::{Broadcaster, Flush, Ingest};
pub use config::ServerConfig;
pub use errors::{ConfigError, HandshakeError, ReactorError, SetupError};
pub use loader::load_config;
pub use reactor::{Flow, Reactor};
pub use registry::{Client, ClientRegistry, WriteInterest};
pub use supervisor::{ControlHandle, WorkerProcess, spawn_worker, start, start_with_config, worker_reactor};
