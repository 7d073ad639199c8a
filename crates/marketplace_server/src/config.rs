//! Startup configuration: one immutable value built once from the
//! environment and handed out by `Arc` reference, never a mutable
//! process-wide singleton. Missing or invalid values fail fast here rather
//! than surfacing as a confusing error on the first request that needs them.

use std::path::PathBuf;

use anyhow::{Context, Result};
use marketplace_protocol::defaults::{
    DEFAULT_ACTIVATION_THRESHOLD, DEFAULT_ANALYSIS_JPEG_QUALITY, DEFAULT_BATCH_SIZE,
    DEFAULT_DESCRIPTION_JPEG_QUALITY, DEFAULT_INNER_DEADLINE_SECS, DEFAULT_MAX_CONCURRENT_JOBS,
    DEFAULT_MAX_IMAGES, DEFAULT_MAX_IMAGE_SIZE, DEFAULT_MIN_IMAGES, DEFAULT_OUTER_DEADLINE_SECS,
    DEFAULT_PACE_SECONDS, DEFAULT_RECON_JPEG_QUALITY, DEFAULT_TRAINING_ITERATIONS,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub max_concurrent_jobs: usize,
    pub min_images: usize,
    pub max_images: usize,
    pub training_iterations: u32,
    pub max_image_size: u32,
    pub batch_size: usize,
    pub pace_seconds: u64,
    pub inner_deadline_secs: u64,
    pub outer_deadline_secs: u64,
    pub recon_jpeg_quality: u8,
    pub analysis_jpeg_quality: u8,
    pub description_jpeg_quality: u8,
    pub activation_threshold: i64,
    pub data_dir: PathBuf,
    pub job_db_url: String,
    pub external_db_url: String,
    pub base_url: String,
    pub viewer_base_url: String,
    pub bind_addr: String,
    pub analyzer_endpoint: String,
    pub analyzer_api_key: String,
    pub analyzer_model: String,
    pub describer_endpoint: String,
    pub describer_api_key: String,
    pub describer_model: String,
    pub colmap_binary: PathBuf,
    pub gsplat_binary: PathBuf,
}

impl AppConfig {
    /// Load from environment variables, falling back to the defaults named
    /// in the configuration surface. Fails fast on malformed numeric values
    /// rather than silently substituting a default.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            max_concurrent_jobs: parse_env("MAX_CONCURRENT_JOBS", DEFAULT_MAX_CONCURRENT_JOBS)?,
            min_images: parse_env("MIN_IMAGES", DEFAULT_MIN_IMAGES)?,
            max_images: parse_env("MAX_IMAGES", DEFAULT_MAX_IMAGES)?,
            training_iterations: parse_env("TRAINING_ITERATIONS", DEFAULT_TRAINING_ITERATIONS)?,
            max_image_size: parse_env("MAX_IMAGE_SIZE", DEFAULT_MAX_IMAGE_SIZE)?,
            batch_size: parse_env("BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            pace_seconds: parse_env("PACE_SECONDS", DEFAULT_PACE_SECONDS)?,
            inner_deadline_secs: parse_env("INNER_DEADLINE_SECS", DEFAULT_INNER_DEADLINE_SECS)?,
            outer_deadline_secs: parse_env("OUTER_DEADLINE_SECS", DEFAULT_OUTER_DEADLINE_SECS)?,
            recon_jpeg_quality: parse_env("RECON_JPEG_QUALITY", DEFAULT_RECON_JPEG_QUALITY)?,
            analysis_jpeg_quality: parse_env("ANALYSIS_JPEG_QUALITY", DEFAULT_ANALYSIS_JPEG_QUALITY)?,
            description_jpeg_quality: parse_env(
                "DESCRIPTION_JPEG_QUALITY",
                DEFAULT_DESCRIPTION_JPEG_QUALITY,
            )?,
            activation_threshold: parse_env("ACTIVATION_THRESHOLD", DEFAULT_ACTIVATION_THRESHOLD)?,
            data_dir: PathBuf::from(string_env("DATA_DIR", "./data")),
            job_db_url: string_env("JOB_DB_URL", "sqlite://./data/jobs.db"),
            external_db_url: string_env("EXTERNAL_DB_URL", "sqlite://./data/external.db"),
            base_url: string_env("BASE_URL", "http://localhost:8080"),
            viewer_base_url: string_env("VIEWER_BASE_URL", "http://localhost:8080/viewer"),
            bind_addr: string_env("BIND_ADDR", "0.0.0.0:8080"),
            analyzer_endpoint: string_env("ANALYZER_ENDPOINT", "https://example.invalid/analyze"),
            analyzer_api_key: string_env("ANALYZER_API_KEY", ""),
            analyzer_model: string_env("ANALYZER_MODEL", "vision-condition-inspector"),
            describer_endpoint: string_env("DESCRIBER_ENDPOINT", "https://example.invalid/describe"),
            describer_api_key: string_env("DESCRIBER_API_KEY", ""),
            describer_model: string_env("DESCRIBER_MODEL", "vision-describer"),
            colmap_binary: PathBuf::from(string_env("COLMAP_BINARY", "colmap")),
            gsplat_binary: PathBuf::from(string_env("GSPLAT_BINARY", "gsplat-train")),
        })
    }

    pub fn product_dir(&self, product_id: &str) -> PathBuf {
        self.data_dir.join(product_id)
    }
}

fn string_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(e).with_context(|| format!("failed to read {key}")),
    }
}
