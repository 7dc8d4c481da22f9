//! Telemetry Bridge - Main Entry Point
//!
//! Loads the configuration, starts the control API and the bridge, then waits
//! for a termination signal or an API shutdown request.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use telemetry_bridge::api;
use telemetry_bridge::config::BridgeConfig;
use telemetry_bridge::observability::{init_default_logging, uptime::mark_process_start};
use telemetry_bridge::BridgeApp;
use tokio::signal;
use tracing::{error, info};

/// Multi-device MQTT telemetry bridge
#[derive(Parser)]
#[command(name = "telemetry-bridge")]
#[command(about = "Bridge device telemetry from MQTT to an HTTP ingestion endpoint")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until a signal or shutdown request arrives
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    mark_process_start();
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        let level = if cli.verbose > 1 { "trace" } else { "debug" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    info!(
        "Starting telemetry bridge v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(BridgeConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["bridge.toml", "config/bridge.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(BridgeConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create bridge.toml"
                .into())
        }
    }
}

async fn run_bridge(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let port = config.server.port;
    let app = BridgeApp::from_config(config)?;

    install_panic_hook(&app);

    let mut server_shutdown = app.shutdown_trigger().subscribe();
    let api_app = app.clone();
    let server = tokio::spawn(async move {
        let signal = async move {
            let _ = server_shutdown.wait_for(|requested| *requested).await;
        };
        if let Err(e) = api::serve(api_app, port, signal).await {
            error!("Control API error: {}", e);
        }
    });

    if let Err(e) = app.start().await {
        error!("Bridge failed to start: {}", e);
        app.request_shutdown();
        app.shutdown().await?;
        let _ = server.await;
        return Err(e.into());
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sigquit = signal::unix::signal(signal::unix::SignalKind::quit())?;

    info!("Bridge is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = sigquit.recv() => {
            info!("Received SIGQUIT, shutting down gracefully...");
        }
        _ = app.wait_for_shutdown_request() => {
            info!("Shutdown requested, shutting down gracefully...");
        }
    }

    app.request_shutdown();
    app.shutdown().await?;
    let _ = server.await;
    Ok(())
}

/// Log panics and ask the bridge to shut down instead of leaving it half alive
fn install_panic_hook(app: &Arc<BridgeApp>) {
    let trigger = app.shutdown_trigger();
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("Unhandled panic: {}", panic_info);
        trigger.send_replace(true);
        previous(panic_info);
    }));
}

fn handle_config_command(
    config: BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!(
        device_count = config.devices.len(),
        "Configuration validation complete"
    );
    Ok(())
}
