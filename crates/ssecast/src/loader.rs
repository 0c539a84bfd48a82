//! Layered server config: compiled defaults, then an optional JSON file,
//! then `SSECAST_*` environment variables.
//!
//! The file is a flat JSON object keyed by [`ServerConfig`] field names.
//! Absent keys and keys set to `null` keep their default.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::config::ServerConfig;
use crate::errors::ConfigError;

/// Env var overriding [`ServerConfig::host`].
pub const ENV_HOST: &str = "SSECAST_HOST";
/// Env var overriding [`ServerConfig::port`].
pub const ENV_PORT: &str = "SSECAST_PORT";
/// Env var overriding [`ServerConfig::read_capacity`].
pub const ENV_READ_CAPACITY: &str = "SSECAST_READ_CAPACITY";
/// Env var overriding [`ServerConfig::event_capacity`].
pub const ENV_EVENT_CAPACITY: &str = "SSECAST_EVENT_CAPACITY";
/// Env var overriding [`ServerConfig::client_read_buffer`].
pub const ENV_CLIENT_READ_BUFFER: &str = "SSECAST_CLIENT_READ_BUFFER";

/// Load config from an optional file, then apply env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a config that fails
/// [`ServerConfig::validate`] is an error.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let mut config = match path {
        Some(path) => load_file(path)?,
        None => ServerConfig::default(),
    };
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Read a config file over the defaults, without env overrides.
///
/// A missing file yields defaults.
pub fn load_file(path: &Path) -> Result<ServerConfig, ConfigError> {
    if !path.exists() {
        debug!(?path, "config file not found, using defaults");
        return Ok(ServerConfig::default());
    }
    debug!(?path, "loading config from file");
    let content = std::fs::read_to_string(path)?;
    let Value::Object(mut fields) = serde_json::from_str::<Value>(&content)? else {
        return Err(ConfigError::InvalidValue(
            "config file must contain a JSON object".into(),
        ));
    };
    fields.retain(|_, v| !v.is_null());
    Ok(serde_json::from_value(Value::Object(fields))?)
}

/// Apply `SSECAST_*` environment variable overrides.
///
/// Invalid values are ignored with a warning (fall back to file/default).
pub fn apply_env_overrides(config: &mut ServerConfig) {
    apply_overrides(config, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup (testable without env vars).
pub fn apply_overrides(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup(ENV_HOST).filter(|v| !v.is_empty()) {
        config.host = v;
    }
    if let Some(v) = read_parsed(&lookup, ENV_PORT, |v| parse_u16_range(v, 0, u16::MAX)) {
        config.port = v;
    }
    if let Some(v) = read_parsed(&lookup, ENV_READ_CAPACITY, |v| {
        parse_usize_range(v, 1, 1 << 20)
    }) {
        config.read_capacity = v;
    }
    if let Some(v) = read_parsed(&lookup, ENV_EVENT_CAPACITY, |v| {
        parse_usize_range(v, 1, 65_536)
    }) {
        config.event_capacity = v;
    }
    if let Some(v) = read_parsed(&lookup, ENV_CLIENT_READ_BUFFER, |v| {
        parse_usize_range(v, 1, 1 << 20)
    }) {
        config.client_read_buffer = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let val = lookup(name)?;
    let result = parse(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}
