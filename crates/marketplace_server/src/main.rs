//! Marketplace back-office HTTP surface: binds the defect-analysis and
//! 3D-reconstruction pipelines to axum, persists job state in sqlite, and
//! mirrors terminal outcomes into the external system-of-record.

mod config;
mod error;
mod object_store;
mod recon_runner;
mod routes;
mod state;

use std::sync::Arc;

use clap::Parser;
use marketplace_db::{ensure_external_schema, ensure_jobstore_schema, open_sqlite_pool, ExternalMirror, JobStore};
use marketplace_logging::{init_logging, LogConfig};
use marketplace_protocol::defaults::CANCELLED_BY_SHUTDOWN_MESSAGE;
use marketplace_protocol::types::{ErrorKind, JobKind};

use config::AppConfig;
use state::AppState;

#[derive(Parser, Debug)]
#[command(name = "marketplace-server", about = "HTTP surface for the marketplace back-office pipelines")]
struct Args {
    /// Force debug-level logging regardless of RUST_LOG.
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(LogConfig {
        app_name: "marketplace_server",
        verbose: args.verbose,
    })?;

    let config = AppConfig::from_env()?;
    tracing::info!(bind_addr = %config.bind_addr, data_dir = %config.data_dir.display(), "starting marketplace_server");

    let job_pool = open_sqlite_pool(&config.job_db_url).await?;
    ensure_jobstore_schema(&job_pool).await?;
    let job_store = JobStore::new(job_pool);

    let external_pool = open_sqlite_pool(&config.external_db_url).await?;
    ensure_external_schema(&external_pool).await?;
    let external_mirror = ExternalMirror::with_activation_threshold(external_pool, config.activation_threshold);

    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config, job_store, external_mirror));
    let app = routes::build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

/// Wait for ctrl-c or SIGTERM, then cancel every in-flight recon job and mark
/// every still-queued job failed(shutdown). Jobs already running finish
/// their current stage before `ReconPipeline` observes the cancellation and
/// stops - there is no in-flight job recovery across process restarts.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, cancelling in-flight jobs");
    state.cancel_all_running().await;

    for kind in [JobKind::Analysis, JobKind::Recon] {
        let pending = match state.job_store.list_pending(kind).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(%kind, error = %e, "failed to list pending jobs during shutdown");
                continue;
            }
        };
        for job in pending {
            if let Err(e) = state
                .job_store
                .mark_failed(&job.product_id, ErrorKind::Shutdown, &job.stage, CANCELLED_BY_SHUTDOWN_MESSAGE)
                .await
            {
                tracing::warn!(product_id = %job.product_id, error = %e, "failed to mark queued job failed at shutdown");
            }
        }
    }
}
