//! # ssecast-worker
//!
//! Runs one ssecast server whose control channel is standard input. Each
//! chunk written to stdin is broadcast to every subscriber; closing stdin
//! shuts the server down.
//!
//! Once bound, prints `listening <addr>` on stdout. Logs go to stderr.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ssecast::control::ready_line;
use ssecast::logging::{init_json_subscriber, init_subscriber};
use ssecast::{ServerConfig, load_config, worker_reactor};

/// ssecast worker process.
#[derive(Parser, Debug)]
#[command(name = "ssecast-worker", about = "SSE broadcast server controlled over stdin")]
struct Cli {
    /// Host to bind (overrides config file and environment).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config file and environment).
    #[arg(long)]
    port: Option<u16>,

    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = load_config(self.config.as_deref()).context("Failed to load config")?;
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config.validate().context("Invalid config")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        init_json_subscriber(&cli.log_level);
    } else {
        init_subscriber(&cli.log_level);
    }

    let config = cli.server_config()?;
    let reactor = worker_reactor(&config).context("Failed to start server")?;
    let addr = reactor
        .local_addr()
        .context("Failed to read listener address")?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", ready_line(addr)).context("Failed to report readiness")?;
    stdout.flush().context("Failed to report readiness")?;
    drop(stdout);

    reactor.run().context("Event loop failed")?;
    tracing::info!("worker exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from(["ssecast-worker", "--host", "0.0.0.0", "--port", "9100"]);
        let config = cli.server_config().unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9100);
    }

    #[test]
    fn defaults_without_flags() {
        let cli = Cli::parse_from(["ssecast-worker"]);
        assert_eq!(cli.log_level, "info");
        assert!(!cli.json_logs);
        assert!(cli.host.is_none());
    }

    #[test]
    fn config_file_is_layered_under_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, r#"{"host": "127.0.0.1", "port": 9200, "read_capacity": 64}"#)
            .unwrap();

        let cli = Cli::parse_from([
            "ssecast-worker",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "9300",
        ]);
        let config = cli.server_config().unwrap();
        assert_eq!(config.port, 9300);
        assert_eq!(config.read_capacity, 64);
    }
}
