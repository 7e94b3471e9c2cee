//! Quasar room server binary.
//!
//! Loads `config.ron`, applies CLI overrides, initializes logging, and
//! serves a relay lobby room. Run with `cargo run -p quasar-server`; override
//! settings with flags, e.g. `cargo run -p quasar-server -- --port 9000`.

mod relay;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use quasar_config::{CliArgs, Config, NetworkConfig};
use quasar_log::init_logging;
use quasar_net::framing::FrameConfig;
use quasar_net::listener::{Listener, ListenerConfig};
use quasar_rooms::{JoinCoordinator, RoomRegistry};
use relay::RelayRoom;

/// How often the lobby's broadcast boundary fires.
const BROADCAST_TICK: Duration = Duration::from_millis(100);

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("quasar"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn listener_config(network: &NetworkConfig) -> Option<ListenerConfig> {
    let bind_addr = format!("{}:{}", network.bind_address, network.port)
        .parse()
        .ok()?;
    Some(ListenerConfig {
        bind_addr,
        max_connections: network.max_connections as usize,
        keepalive_interval: network.keepalive_interval(),
        connection_timeout: network.connection_timeout(),
        handshake_timeout: network.handshake_timeout(),
        frame: FrameConfig {
            max_message_size: network.max_message_size,
        },
        simulated_latency: network.simulated_latency(),
    })
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config from {}: {e}", config_dir.display());
            std::process::exit(1);
        }
    };
    config.apply_cli_overrides(&args);

    init_logging(None, cfg!(debug_assertions), Some(&config));

    let Some(listener_config) = listener_config(&config.network) else {
        tracing::error!(
            address = %config.network.bind_address,
            port = config.network.port,
            "invalid bind address"
        );
        std::process::exit(1);
    };

    let registry = Arc::new(RoomRegistry::new());
    let lobby = RelayRoom::with_open_seating("lobby");
    let _broadcast = lobby.spawn_broadcast_tick(BROADCAST_TICK);
    registry.register(lobby);
    tracing::info!(room = "lobby", "registered relay room");

    let coordinator = Arc::new(JoinCoordinator::new(registry));
    let listener = Listener::new(listener_config, coordinator);

    if let Err(e) = listener.run().await {
        tracing::error!(error = %e, "listener failed");
        std::process::exit(1);
    }
}
