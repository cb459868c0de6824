//! Fleet-control daemon
//!
//! Runs the agent listener, the operator IPC server and the periodic
//! status reporter until interrupted or asked to shut down over IPC.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fc_control::ipc::IpcServer;
use fc_control::report::run_status_reporter;
use fc_control::server::AgentServer;
use fc_control::ControlState;
use fc_core::auth::generate_token;
use fc_core::config::{self, ControlConfig};

#[derive(Parser)]
#[command(name = "fc-control")]
#[command(about = "Fleet control-plane daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "FC_CONFIG")]
    config: Option<PathBuf>,

    /// Agent bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Localhost IPC port (overrides config)
    #[arg(long)]
    ipc_port: Option<u16>,

    /// Directory for tasks, logs and session statistics (overrides config)
    #[arg(long, env = "FC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Fleet control starting...");

    // Load configuration
    let mut config: ControlConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ControlConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            ControlConfig::default()
        }
    };

    if let Some(bind) = args.bind {
        config.agent_bind_address = bind;
    }
    if let Some(port) = args.ipc_port {
        config.ipc_port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    config.validate().context("Invalid configuration")?;

    if config.agent_token.is_none() {
        tracing::warn!(
            "No agent token configured - any agent may register (e.g. agent_token = \"{}\")",
            generate_token()
        );
    }
    tracing::info!("Data directory: {:?}", config.data_dir);

    let state = Arc::new(ControlState::with_data_dir(config.clone()));
    match state.scheduler.restore() {
        Ok(count) => tracing::info!("Loaded {} scheduled tasks", count),
        Err(e) => tracing::warn!("Failed to load scheduled tasks: {}", e),
    }

    let cancel = state.shutdown.clone();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    // Operator IPC
    let ipc = IpcServer::new(config.ipc_address(), Arc::clone(&state))
        .with_shutdown_token(cancel.clone());
    let ipc_task = tokio::spawn(async move {
        if let Err(e) = ipc.run().await {
            tracing::error!("IPC server failed: {:#}", e);
        }
    });

    // Status reports
    let reporter = tokio::spawn(run_status_reporter(Arc::clone(&state), cancel.clone()));

    // Agent transport
    let server = AgentServer::new(Arc::clone(&state), cancel.clone());
    tracing::info!("Starting agent server on {}", config.agent_bind_address);
    let result = server.run(&config.agent_bind_address).await;

    // Listener failure or shutdown request: stop everything
    state.shutdown();
    let _ = ipc_task.await;
    let _ = reporter.await;

    result?;
    tracing::info!("Fleet control shutdown complete");
    Ok(())
}
