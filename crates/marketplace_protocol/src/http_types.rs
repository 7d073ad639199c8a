//! HTTP request/response DTOs for the thin transport layer.
//!
//! These types carry no behavior; `marketplace_server` binds them to axum
//! handlers and the orchestrator/pipeline crates never depend on this module.

use serde::{Deserialize, Serialize};

use crate::types::{ErrorKind, ImageVerdict};

#[derive(Debug, Clone, Deserialize)]
pub struct FaultDescRequest {
    pub product_id: String,
    pub image_refs: Vec<String>,
    pub product_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaultDescResponse {
    pub product_id: String,
    pub inspection_results: Vec<ImageVerdict>,
    pub aggregated_condition: String,
    pub aggregated_price_adjustment: i32,
    pub total_defects_count: usize,
    pub markdown_summary: String,
    pub completed_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeDescRequest {
    pub image_ref: String,
    pub product_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeDescResponse {
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateReconJobRequest {
    pub product_id: String,
    pub s3_images: Vec<String>,
    pub iterations: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateReconJobResponse {
    pub product_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusResponse {
    pub product_id: String,
    pub status: String,
    pub stage: String,
    pub progress: u8,
    pub image_count: u32,
    pub iterations: Option<u32>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_stage: Option<String>,
    pub error_message: Option<String>,
    pub log_tail: Vec<String>,
    pub queue_position: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueJobSummary {
    pub product_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuePendingSummary {
    pub product_id: String,
    pub position: usize,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatusResponse {
    pub max_concurrent: usize,
    pub running_count: usize,
    pub pending_count: usize,
    pub running_jobs: Vec<QueueJobSummary>,
    pub pending_jobs: Vec<QueuePendingSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlyQualityQuery {
    #[serde(default = "default_quality")]
    pub quality: String,
}

fn default_quality() -> String {
    "full".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}
