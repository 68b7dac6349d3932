//! Energy-monitoring messaging core - main entry point

use ems_messaging::config::AppConfig;
use ems_messaging::gateway::{generate_credentials, GatewayProtocol};
use ems_messaging::observability::init_default_logging;
use ems_messaging::protocol::{validate_segment_id, TopicBuilder};
use ems_messaging::service::{Collaborators, MessagingService};
use ems_messaging::testing::{InMemoryPersistence, MemoryAuditLog, RecordingBroadcaster};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Device messaging core: broker connection, routing, commands and gateways
#[derive(Parser)]
#[command(name = "ems-messaging")]
#[command(about = "Device messaging core for energy monitoring")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "EMS_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the messaging service until SIGINT/SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Generate a fresh credential set for a gateway
    Credentials {
        /// message-broker, http or raw-tcp
        #[arg(long)]
        protocol: String,
        #[arg(long)]
        gateway_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var_os("LOG_LEVEL").is_none() {
        let level = if cli.verbose > 1 { "trace" } else { "debug" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    info!("Starting ems-messaging v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_service(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Credentials {
            protocol,
            gateway_id,
        } => handle_credentials_command(&config, &protocol, &gateway_id),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<AppConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AppConfig::load_from_file(path)?);
    }

    for path_str in ["ems.toml", "config/ems.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AppConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create ems.toml".into())
}

async fn run_service(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Service ID: {}", config.service.id);
    if config.uses_memory_broker() {
        warn!("No broker_url configured, using the in-memory broker");
    }

    // Storage and dashboard fan-out are provided by the host application;
    // standalone runs use the in-memory implementations.
    let collaborators = Collaborators {
        persistence: Arc::new(InMemoryPersistence::new()),
        broadcaster: Arc::new(RecordingBroadcaster::new()),
        audit: Arc::new(MemoryAuditLog::new()),
    };

    let mut service = MessagingService::build(config, collaborators)?;
    service.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Messaging service is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = service.closed() => {
            error!("Broker connection permanently closed, shutting down...");
        }
    }

    if let Err(e) = service.shutdown().await {
        error!("Error during shutdown: {}", e);
        service.metrics().set_service_state("error");
        return Err(e.into());
    }
    Ok(())
}

fn handle_config_command(config: &AppConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

fn handle_credentials_command(
    config: &AppConfig,
    protocol: &str,
    gateway_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let protocol = GatewayProtocol::parse(protocol)
        .ok_or_else(|| format!("Unknown gateway protocol: {protocol}"))?;
    validate_segment_id(gateway_id)?;

    let topics = TopicBuilder::new(&config.mqtt.topic_root);
    let credentials = generate_credentials(protocol, gateway_id, &topics);

    // Printed once; the secrets are not stored anywhere by this command
    println!("{}", serde_json::to_string_pretty(&credentials)?);
    Ok(())
}
