//! Parlance Server - headless Asterisk ARI voice agent.
//!
//! Connects to the PBX control plane, accepts inbound calls and runs them
//! through the configured STT/LLM/TTS pipeline. Designed to run as a
//! background daemon next to Asterisk.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use parlance_core::bootstrap;
use tokio::signal;

/// Parlance Server - Asterisk ARI voice agent.
#[derive(Parser, Debug)]
#[command(name = "parlance-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "PARLANCE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// ARI password (overrides config file).
    #[arg(long, env = "PARLANCE_ARI_PASSWORD", hide_env_values = true)]
    ari_password: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Parlance Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(password) = args.ari_password {
        config.asterisk.password = password;
    }

    log::info!(
        "Configuration: transport={:?}, downstream={:?}, pipelines={}, active={}",
        config.audio_transport,
        config.downstream_mode,
        config.pipelines.len(),
        config.default_pipeline().unwrap_or("-")
    );

    let services = bootstrap(config)
        .await
        .context("Failed to bootstrap services")?;

    log::info!("Parlance is accepting calls");

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    services.shutdown().await;
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
