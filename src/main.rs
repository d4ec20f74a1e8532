//! Matter to MQTT bridge - main entry point

use clap::{Parser, Subcommand};
use matter_mqtt_bridge::bridge::topics::TopicBuilder;
use matter_mqtt_bridge::bridge::Bridge;
use matter_mqtt_bridge::config::BridgeConfig;
use matter_mqtt_bridge::error::BridgeError;
use matter_mqtt_bridge::observability::init_default_logging;
use matter_mqtt_bridge::transport::mqtt::MqttClient;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// Default config locations, searched in order when `--config` is absent
const DEFAULT_CONFIG_PATHS: &[&str] = &["bridge.toml", "config/bridge.toml"];

/// Mirror Matter devices into MQTT topics
#[derive(Parser)]
#[command(name = "matter-mqtt-bridge")]
#[command(about = "Bridge between a matter-server websocket and an MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge (default)
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Matter MQTT bridge"
    );

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e.sanitized(), "Failed to load configuration");
            process::exit(1);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(error = %e.sanitized(), "Bridge failed");
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> Result<BridgeConfig, BridgeError> {
    if let Some(path) = config_path {
        info!(path = %path.display(), "Loading configuration");
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!(path = %path.display(), "Loading configuration");
            return Ok(BridgeConfig::load_from_file(path)?);
        }
    }

    info!("No configuration file found, using defaults and environment");
    Ok(BridgeConfig::from_env()?)
}

async fn run_bridge(config: BridgeConfig) -> Result<(), BridgeError> {
    let topics = TopicBuilder::new(config.mqtt.base_topic.clone());
    let transport = Arc::new(MqttClient::new(&config.mqtt, &topics)?);

    info!(
        matter = %config.matter.server_url,
        broker = %config.mqtt.broker_url,
        base_topic = %config.mqtt.base_topic,
        "Bridge configured"
    );

    let mut bridge = Bridge::new(config, transport)?;
    bridge.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .map_err(|e| BridgeError::internal(format!("Failed to install SIGINT handler: {e}")))?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| BridgeError::internal(format!("Failed to install SIGTERM handler: {e}")))?;

    info!("Bridge is running");

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    bridge.shutdown().await
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> Result<(), BridgeError> {
    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| BridgeError::internal(format!("Failed to render configuration: {e}")))?;
        println!("{rendered}");
    }

    info!("Configuration validation complete");
    Ok(())
}
