use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use fabric_tunnel::commands;
use fabric_tunnel::config::{self, Config};
use fabric_tunnel::error::{ConfigError, Result};
use fabric_tunnel::fabric::{KernelNetwork, VirtualNetwork};
use fabric_tunnel::proxy::TunnelProxy;
use fabric_tunnel::server::{MetricsServer, ProxyServer};
use fabric_tunnel::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "fabric-tunnel")]
#[command(about = "CONNECT tunneling proxy for an encrypted point-to-point fabric", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the proxy server (default)
    Run,
    /// Validate configuration and print the device request that would be sent
    Check {
        /// Print key material instead of masking it
        #[arg(long)]
        show_keys: bool,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    let directive: tracing_subscriber::filter::Directive = format!("fabric_tunnel={log_level}")
        .parse()
        .map_err(|e| ConfigError::Parse(format!("invalid log directive: {e}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();

    let config = match args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            config::load_from_path(&path).await.inspect_err(|e| {
                error!("Failed to load configuration from {}: {}", path.display(), e);
            })?
        }
        None => {
            info!("Loading configuration from default locations");
            config::load_from_env_or_file().await.inspect_err(|e| {
                error!("Failed to load configuration: {}", e);
            })?
        }
    };

    match args.command.unwrap_or(Command::Run) {
        Command::Check { show_keys, json } => {
            commands::run_config_check(config, show_keys, json).await
        }
        Command::Run => run(config).await,
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Starting fabric tunnel proxy");
    info!("Role: {:?}", config.proxy.role);
    info!("Proxy will listen on {}", config.listen_addr());

    #[cfg(unix)]
    if let Err(e) = commands::configure_device(&config).await {
        error!("Failed to configure fabric device: {}", e);
        return Err(e);
    }

    let network = kernel_network(&config)?;
    let (state, _shutdown_rx) = AppState::new(config);

    let proxy = Arc::new(TunnelProxy::new(state.proxy_options(Some(network)).await)?);
    let proxy_server = ProxyServer::new(state.clone(), proxy);
    let mut proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!("Proxy server error: {}", e);
        }
    });

    let metrics_server = MetricsServer::new(state.clone());
    let metrics_handle = tokio::spawn(async move {
        if let Err(e) = metrics_server.run().await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = &mut proxy_handle => {
            error!("Proxy server exited unexpectedly");
        }
    }

    info!("Shutting down fabric tunnel proxy");

    let shutdown_timeout = tokio::time::timeout(tokio::time::Duration::from_secs(30), async {
        state.shutdown().await;
        if !proxy_handle.is_finished() {
            let _ = proxy_handle.await;
        }
        let _ = metrics_handle.await;
    })
    .await;

    match shutdown_timeout {
        Ok(_) => {
            info!("Graceful shutdown completed");
        }
        Err(_) => {
            error!("Shutdown timeout exceeded, forcing exit");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn kernel_network(config: &Config) -> Result<Arc<dyn VirtualNetwork>> {
    let mut network = KernelNetwork::new();
    let local = match &config.fabric.local_address {
        Some(addr) => Some(addr.parse::<IpAddr>().map_err(|e| {
            ConfigError::Validation(format!("Fabric local address '{}': {}", addr, e))
        })?),
        None => config
            .device
            .as_ref()
            .and_then(|device| device.addresses.first().copied()),
    };
    if let Some(addr) = local {
        info!("Dialing fabric peers from {}", addr);
        network = network.with_local_addr(addr);
    }
    Ok(Arc::new(network))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
