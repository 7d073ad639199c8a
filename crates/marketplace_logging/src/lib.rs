//! Shared logging setup for the marketplace back-office binaries.

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter applied when `RUST_LOG` is unset: info for our own crates, warn elsewhere.
const DEFAULT_LOG_FILTER: &str =
    "marketplace_server=info,marketplace_orchestrator=info,marketplace_pipeline=info,marketplace_db=info,warn";

/// Logging configuration shared by the marketplace binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// When true, force full verbosity regardless of `RUST_LOG`.
    pub verbose: bool,
}

/// Initialize `tracing` with an env-filtered stderr layer.
///
/// Single entry point so every binary in the workspace logs the same way;
/// call once, at process start, before spawning any job.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .try_init()
        .with_context(|| format!("failed to install tracing subscriber for {}", config.app_name))?;

    Ok(())
}
