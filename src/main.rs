use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::{FloodgateConfig, KILL_SWITCH_ENV};
use floodgate::http::HttpServer;
use floodgate::ratelimit::{presets, PolicyRegistry, RulesConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Rate limiting HTTP front end.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Args {
    /// Settings file (YAML)
    #[arg(short, long)]
    config: Option<String>,

    /// Policy rules file (YAML); overrides the settings file
    #[arg(short, long)]
    rules: Option<String>,

    /// Listen address; overrides the settings file
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    info!("Starting Floodgate Admission Control");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = FloodgateConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(rules) = args.rules {
        config.rate_limiting.rules_path = Some(rules);
    }
    let kill_switch = std::env::var(KILL_SWITCH_ENV).ok();
    config.apply_kill_switch(kill_switch.as_deref());
    info!(
        listen_addr = %config.server.listen_addr,
        mode = ?config.rate_limiting.mode,
        "Configuration loaded"
    );

    let registry =
        Arc::new(PolicyRegistry::with_system_clock().with_mode(config.rate_limiting.mode));

    match &config.rate_limiting.rules_path {
        Some(path) => RulesConfig::from_file(path)?.install(&registry)?,
        None => {
            warn!("No rules file configured, using built-in presets");
            presets::install(&registry)?;
        }
    }
    info!(policies = ?registry.policy_names(), "Policies registered");

    registry.start_janitor(config.rate_limiting.janitor_interval())?;

    let server = HttpServer::new(config.server.listen_addr, Arc::clone(&registry));
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    registry.shutdown().await;
    served?;

    info!("Floodgate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
