//! Two-role entry point: `entorelay relay` runs the public relay process,
//! `entorelay bridge` runs the operator-side bridge client.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use entorelay::bridge::{BridgeClient, EchoResponder};
use entorelay::config::{self, BridgeClientConfig, RelayConfig};
use entorelay::relay;

#[derive(Parser)]
#[command(name = config::APP_NAME, version = config::APP_VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the public relay (mobile gateway + bridge tunnel + pairing API).
    Relay {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run the operator-side bridge client, dialing out to a relay.
    Bridge {
        #[arg(long, env = "RELAY_URL")]
        relay_url: Option<String>,
        #[arg(long, env = "BRIDGE_TOKEN")]
        bridge_token: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(config::default_log_env_filter())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Relay { config: config_path } => run_relay(config_path.as_deref()).await,
        Command::Bridge { relay_url, bridge_token } => run_bridge(relay_url, bridge_token).await,
    }
}

async fn run_relay(config_path: Option<&std::path::Path>) {
    let cfg = match RelayConfig::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "failed to load relay configuration");
            std::process::exit(1);
        }
    };

    tracing::info!(
        version = config::APP_VERSION,
        port = cfg.mobile.websocket_port,
        "entorelay starting in relay mode"
    );

    let mut handle = match relay::start_relay(cfg).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay");
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %handle.addr, "relay listening");
    relay::wait_for_shutdown_signal().await;
    handle.shutdown();
}

async fn run_bridge(relay_url: Option<String>, bridge_token: Option<String>) {
    let mut cfg = BridgeClientConfig::default();
    if let Some(url) = relay_url {
        cfg.relay_url = url;
    }
    if let Some(token) = bridge_token {
        cfg.bridge_token = token;
    }

    if cfg.bridge_token.is_empty() {
        tracing::error!("bridge_token is required (pass --bridge-token or set BRIDGE_TOKEN)");
        std::process::exit(1);
    }

    tracing::info!(relay_url = %cfg.relay_url, "entorelay starting in bridge mode");

    let client = BridgeClient::new(cfg.relay_url, cfg.bridge_token, Arc::new(EchoResponder));
    client.run().await;
}
