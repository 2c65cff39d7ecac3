use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use common::config::Settings;
use common::mq::MqContext;
use common::telemetry;
use server::{routes, state::AppState};

/// Supervise message queue consumers that forward deliveries over HTTP
#[derive(Debug, Parser)]
#[command(name = "message-jobber", version, about)]
struct Cli {
    /// Extra configuration file layered over the config directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding default.toml and local.toml
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Settings::load_from_path(&cli.config_dir, cli.config.as_deref())?;
    config.validate().map_err(anyhow::Error::msg)?;

    telemetry::init_logging(&config.observability.log_level, config.observability.json)?;
    if let Some(port) = config.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        brokers = ?config.rabbitmq.brokers,
        include = %config.include,
        "Configuration loaded"
    );

    let mq = MqContext::from_settings(&config)?;
    let loaded = mq.load_definitions()?;
    tracing::info!(jobbers = loaded, "Jobbers registered");

    let cancel = CancellationToken::new();
    let supervisor = mq.spawn_supervisor(cancel.clone());

    let app = routes::create_router(AppState::new(mq.clone()));

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));
    tracing::info!(addr = %addr, "Starting control server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    mq.shutdown(cancel, supervisor).await;
    tracing::info!("Message jobber stopped");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Initiating graceful shutdown");
}
