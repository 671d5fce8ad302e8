//! Camera Sync - Main entry point
//!
//! Runs the polling API with the hourly schedule check, or a single copy or
//! transfer from the command line.

use anyhow::Result;
use camera_sync::api::{self, job_tracker::JobTracker, AppState};
use camera_sync::config::Config;
use camera_sync::daemon::ShutdownCoordinator;
use camera_sync::executor::manifest::{ManifestStore, COPY_MANIFEST, UPLOAD_MANIFEST};
use camera_sync::executor::{CameraCopyJob, JobSummary, TransferExecutor};
use camera_sync::scheduler::SyncScheduler;
use camera_sync::transfer::LogProgress;
use camera_sync::utils;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the job API and run scheduled copies and transfers
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Copy new images off the camera now
    Copy {
        /// Invoked at boot; only copies when copy_on_bootup is set
        #[arg(long)]
        bootup: bool,
    },
    /// Upload the photo store now
    Transfer,
    /// Rewrite the copy and upload manifests without duplicates or damaged lines
    RepairManifest,
    /// Print the effective configuration as TOML
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    if let Command::PrintConfig = args.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    match args.command {
        Command::Serve { port } => serve(config, args.config, port).await,
        Command::Copy { bootup } => {
            if bootup && !config.copy.copy_on_bootup {
                tracing::info!("Copy on bootup disabled, nothing to do");
                return Ok(());
            }
            let camera = CameraCopyJob::from_config(&config.copy);
            let summary = TransferExecutor::new(Arc::new(LogProgress))
                .run_camera_copy(&config, camera)
                .await;
            finish(summary)
        }
        Command::Transfer => {
            let summary = TransferExecutor::new(Arc::new(LogProgress))
                .run_cloud_transfer(&config)
                .await;
            finish(summary)
        }
        Command::RepairManifest => {
            for name in [COPY_MANIFEST, UPLOAD_MANIFEST] {
                let mut manifest = ManifestStore::load(config.paths.photos_dir.join(name))?;
                let report = manifest.repair()?;
                tracing::info!(
                    manifest = %manifest.path().display(),
                    kept = report.kept,
                    duplicates = report.duplicates,
                    malformed = report.malformed,
                    "Manifest checked"
                );
            }
            Ok(())
        }
        Command::PrintConfig => Ok(()),
    }
}

async fn serve(config: Config, config_path: Option<PathBuf>, port: Option<u16>) -> Result<()> {
    api::health::init_start_time();

    tracing::info!("Starting camera-sync v{}", env!("CARGO_PKG_VERSION"));

    let port = port.unwrap_or(config.agent.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let shutdown_coordinator = ShutdownCoordinator::new();
    let tracker = JobTracker::with_shutdown(shutdown_coordinator.token());

    let scheduler = SyncScheduler::new(tracker.clone(), config_path.clone()).await?;
    scheduler.init_schedules().await?;
    scheduler.start().await?;

    if config.copy.copy_on_bootup {
        if let Err(e) = api::jobs::start_camera_copy(&tracker, config.clone()).await {
            tracing::warn!(error = %e, "Bootup copy not started");
        }
    }

    let app = api::create_router(AppState::new(tracker.clone(), config_path));

    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Health endpoint: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_token = shutdown_coordinator.token();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await
    });

    shutdown_coordinator.wait_for_signal().await;

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = %e, "Scheduler shutdown failed");
    }
    shutdown_coordinator.shutdown(&tracker).await;

    match tokio::time::timeout(std::time::Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Server shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Server task panicked: {}", e),
        Err(_) => tracing::warn!("Server shutdown timeout, forcing exit"),
    }

    Ok(())
}

/// One-shot runs exit non-zero when the job aborted.
fn finish(summary: JobSummary) -> Result<()> {
    if summary.outcome.is_aborted() {
        anyhow::bail!(summary.status_line);
    }
    Ok(())
}
