//! `/recon/*` handlers: job submission, status/queue introspection, PLY
//! serving, and the two viewer-redirect endpoints.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use marketplace_orchestrator::StatusReconciler;
use marketplace_pipeline::CancellationToken;
use marketplace_protocol::http_types::{
    CreateReconJobRequest, CreateReconJobResponse, JobStatusResponse, PlyQualityQuery,
    QueueJobSummary, QueuePendingSummary, QueueStatusResponse,
};
use marketplace_protocol::types::{Job, JobKind};

use crate::error::ApiError;
use crate::recon_runner::{self, first_camera_position};
use crate::state::AppState;

pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateReconJobRequest>,
) -> Result<(StatusCode, Json<CreateReconJobResponse>), ApiError> {
    let image_count = request.s3_images.len();
    if image_count < state.config.min_images || image_count > state.config.max_images {
        return Err(ApiError::BadRequest(format!(
            "s3_images must have between {} and {} entries, got {}",
            state.config.min_images, state.config.max_images, image_count
        )));
    }

    let mut job = Job::new(request.product_id.clone(), JobKind::Recon, image_count as u32);
    job.iterations = request.iterations;
    state.job_store.create(&job).await?;

    let reconciler = StatusReconciler::new(&state.external_mirror);
    if let Err(e) = reconciler.on_queued(&request.product_id, JobKind::Recon).await {
        tracing::warn!(product_id = %request.product_id, error = %e, "failed to mirror queued recon job");
    }

    let token = CancellationToken::new();
    state.track_job(request.product_id.clone(), token.clone()).await;

    let background_state = state.clone();
    let product_id = request.product_id.clone();
    let s3_images = request.s3_images.clone();
    tokio::spawn(async move {
        recon_runner::run_recon_job(background_state.clone(), job, s3_images, token).await;
        background_state.untrack_job(&product_id).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateReconJobResponse {
            product_id: request.product_id,
            status: "queued".to_string(),
        }),
    ))
}

pub async fn job_status(
    State(state): State<Arc<AppState>>,
    AxumPath(product_id): AxumPath<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state.job_store.get(&product_id).await?;
    let queue_position = if job.status == marketplace_protocol::types::JobStatus::Queued {
        state.recon_scheduler.queue_position(&product_id).await?
    } else {
        None
    };

    Ok(Json(JobStatusResponse {
        product_id: job.product_id,
        status: job.status.to_string(),
        stage: job.stage,
        progress: job.progress,
        image_count: job.image_count,
        iterations: job.iterations,
        created_at: job.created_at.to_rfc3339(),
        started_at: job.started_at.map(|t| t.to_rfc3339()),
        completed_at: job.completed_at.map(|t| t.to_rfc3339()),
        error_kind: job.error_kind,
        error_stage: job.error_stage,
        error_message: job.error_message,
        log_tail: job.log_tail,
        queue_position,
    }))
}

pub async fn queue_status(State(state): State<Arc<AppState>>) -> Result<Json<QueueStatusResponse>, ApiError> {
    let running = state.job_store.list_running(JobKind::Recon).await?;
    let pending = state.job_store.list_pending(JobKind::Recon).await?;

    let running_jobs = running
        .iter()
        .map(|j| QueueJobSummary {
            product_id: j.product_id.clone(),
            created_at: j.created_at.to_rfc3339(),
        })
        .collect();
    let pending_jobs = pending
        .iter()
        .enumerate()
        .map(|(idx, j)| QueuePendingSummary {
            product_id: j.product_id.clone(),
            position: idx + 1,
            created_at: j.created_at.to_rfc3339(),
        })
        .collect();

    Ok(Json(QueueStatusResponse {
        max_concurrent: state.recon_scheduler.max_concurrent(),
        running_count: running.len(),
        pending_count: pending.len(),
        running_jobs,
        pending_jobs,
    }))
}

pub async fn cloud_ply(
    State(state): State<Arc<AppState>>,
    AxumPath(product_id): AxumPath<String>,
    Query(query): Query<PlyQualityQuery>,
) -> Result<Response, ApiError> {
    let job = state.job_store.get(&product_id).await?;
    let iterations = job
        .iterations
        .unwrap_or(state.config.training_iterations);
    let iteration_dir = state
        .config
        .product_dir(&product_id)
        .join(format!("output/point_cloud/iteration_{iterations}"));

    let filename = match query.quality.as_str() {
        "medium" => "point_cloud_medium.ply",
        "light" => "point_cloud_light.ply",
        _ => "point_cloud.ply",
    };

    let mut path = iteration_dir.join(filename);
    if !path.exists() && query.quality == "light" {
        path = iteration_dir.join("point_cloud.ply");
    }

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::NotFound(format!("no point cloud for {product_id}")))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from(bytes),
    )
        .into_response())
}

pub async fn view(
    State(state): State<Arc<AppState>>,
    AxumPath(product_id): AxumPath<String>,
) -> Result<Redirect, ApiError> {
    let viewer_url = build_viewer_url(&state, &product_id, false).await?;
    Ok(Redirect::to(&viewer_url))
}

pub async fn view_rotate(
    State(state): State<Arc<AppState>>,
    AxumPath(product_id): AxumPath<String>,
) -> Result<Redirect, ApiError> {
    let viewer_url = build_viewer_url(&state, &product_id, true).await?;
    Ok(Redirect::to(&viewer_url))
}

async fn build_viewer_url(state: &Arc<AppState>, product_id: &str, auto_rotate: bool) -> Result<String, ApiError> {
    let job = state.job_store.get(product_id).await?;
    if job.status != marketplace_protocol::types::JobStatus::Done {
        return Err(ApiError::BadRequest(format!(
            "job not completed yet, current status: {}",
            job.status
        )));
    }

    let ply_url = format!("{}/recon/pub/{}/cloud.ply", state.config.base_url, product_id);
    let job_dir = state.config.product_dir(product_id);
    let camera = first_camera_position(&job_dir);

    let viewer_url = if auto_rotate {
        let load_url = format!("{ply_url}?quality=medium");
        match camera {
            Some((x, y, z)) => format!(
                "{}/?load={}&cameraPosition={:.3},{:.3},{:.3}&autoRotate=45&disableInput=true",
                state.config.viewer_base_url,
                load_url,
                x * 6.0,
                y * 6.0,
                z * 6.0
            ),
            None => format!(
                "{}/?load={}&autoRotate=45&disableInput=true",
                state.config.viewer_base_url, load_url
            ),
        }
    } else {
        match camera {
            Some((x, y, z)) => format!(
                "{}/?load={}&cameraPosition={:.3},{:.3},{:.3}",
                state.config.viewer_base_url, ply_url, x, y, z
            ),
            None => format!("{}/?load={}", state.config.viewer_base_url, ply_url),
        }
    };

    Ok(viewer_url)
}
