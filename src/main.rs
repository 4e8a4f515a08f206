use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rollbackr::cli::{run_command, Cli, Commands};
use rollbackr::config::Config;
use rollbackr::health::MonitorScheduler;
use rollbackr::AppContext;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if config.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    match cli.command {
        None | Some(Commands::Serve) => serve(config).await,
        Some(_) => run_command(&cli, config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting rollbackr v{}", env!("CARGO_PKG_VERSION"));

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            tracing::error!(problem = %problem, "Invalid configuration");
        }
        anyhow::bail!("Configuration has {} problem(s)", problems.len());
    }

    let ctx = AppContext::open(config).await?;

    let (stop, shutdown) = watch::channel(false);
    let scheduler = MonitorScheduler::new(ctx.engine.clone(), ctx.config.health.interval());
    let monitors = scheduler.start(shutdown);
    tracing::info!(monitors = monitors.len(), "Health monitors running");

    shutdown_signal().await;

    // Monitors finish their current poll; a rollback in flight runs to completion
    let _ = stop.send(true);
    for monitor in monitors {
        let _ = monitor.await;
    }

    tracing::info!("Stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
