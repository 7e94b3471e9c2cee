//! Command-line argument parsing for the Quasar server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Quasar server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "quasar", about = "Quasar room server")]
pub struct CliArgs {
    /// Bind address.
    #[arg(long)]
    pub bind: Option<String>,

    /// Listener port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum concurrent connections.
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Simulated outbound latency in milliseconds (0 disables).
    #[arg(long)]
    pub latency_ms: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.network.bind_address = bind.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(max) = args.max_connections {
            self.network.max_connections = max;
        }
        if let Some(latency) = args.latency_ms {
            self.network.simulated_latency_ms = latency;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_args() -> CliArgs {
        CliArgs {
            bind: None,
            port: None,
            max_connections: None,
            latency_ms: None,
            log_level: None,
            config: None,
        }
    }

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            bind: Some("127.0.0.1".to_string()),
            port: Some(9000),
            latency_ms: Some(50),
            ..no_args()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.bind_address, "127.0.0.1");
        assert_eq!(config.network.port, 9000);
        assert_eq!(config.network.simulated_latency_ms, 50);
        // Non-overridden fields retain defaults
        assert_eq!(config.network.max_connections, 256);
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&no_args());
        assert_eq!(config, original);
    }
}
