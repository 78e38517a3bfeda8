//! zbx-bridge entry point

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use zbx_bridge::api::ApiServer;
use zbx_bridge::config::{resolve_config_path, ConfigStore, CONFIG_PATH_ENV};
use zbx_bridge::observability::{init_default_logging, init_logging, LogFormat, PushServer};
use zbx_bridge::Bridge;

/// HTTP and MQTT to Zabbix trapper bridge
#[derive(Parser)]
#[command(name = "zbx-bridge")]
#[command(about = "Bridge HTTP and MQTT telemetry into the Zabbix sender protocol")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 {
        let level = if cli.verbose > 1 { Level::TRACE } else { Level::DEBUG };
        let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
        init_logging(level, format, false);
    } else {
        init_default_logging();
    }

    info!("Starting zbx-bridge v{}", env!("CARGO_PKG_VERSION"));

    let path = resolve_config_path(cli.config);
    let store = match ConfigStore::load_or_create(&path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to load configuration from {}: {}", path.display(), e);
            process::exit(1);
        }
    };
    info!("Loaded configuration from: {}", path.display());

    let result = match cli.command {
        Commands::Run => run_bridge(store).await,
        Commands::Config { show } => handle_config_command(&store, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

async fn run_bridge(store: Arc<ConfigStore>) -> Result<(), Box<dyn std::error::Error>> {
    let config = store.get();
    if let Err(e) = config.validate() {
        warn!("Configuration problem: {}", e);
    }

    let bridge = Arc::new(Bridge::from_store(store));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut api = tokio::spawn(
        ApiServer::new(bridge.clone(), config.http.port).run(wait_for_shutdown(shutdown_rx.clone())),
    );
    let mut push = tokio::spawn(
        PushServer::new(bridge.clone(), config.observer.port).run(wait_for_shutdown(shutdown_rx)),
    );

    if let Err(e) = bridge.start().await {
        warn!("MQTT subscription not started: {}", e);
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Bridge is running");

    let mut failure = None;
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        result = &mut api => {
            failure = server_failure("HTTP API", result);
        }
        result = &mut push => {
            failure = server_failure("Observer channel", result);
        }
    }

    info!("Application shutdown initiated");
    let _ = shutdown_tx.send(true);
    bridge.shutdown().await;

    match failure {
        Some(message) => Err(message.into()),
        None => Ok(()),
    }
}

async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
}

fn server_failure(
    name: &str,
    result: Result<zbx_bridge::BridgeResult<()>, tokio::task::JoinError>,
) -> Option<String> {
    match result {
        Ok(Ok(())) => Some(format!("{name} stopped unexpectedly")),
        Ok(Err(e)) => Some(format!("{name} failed: {e}")),
        Err(e) => Some(format!("{name} task failed: {e}")),
    }
}

fn handle_config_command(store: &ConfigStore, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = store.get();

    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config.masked())?);
    }

    config.validate()?;
    info!("Configuration validation complete");
    Ok(())
}
