//! `/inspect/*` handlers: defect analysis and single-image description.
//! Neither ever returns a pipeline failure as an HTTP error - analysis
//! failures become an error-markdown `ProductVerdict`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use marketplace_pipeline::{analyze_product, generate_description, BatchConfig};
use marketplace_protocol::http_types::{
    AnalyzeDescRequest, AnalyzeDescResponse, FaultDescRequest, FaultDescResponse,
};
use marketplace_protocol::types::{Job, JobKind};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn fault_desc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FaultDescRequest>,
) -> Result<Json<FaultDescResponse>, ApiError> {
    if request.image_refs.is_empty() {
        return Err(ApiError::BadRequest("image_refs must not be empty".to_string()));
    }

    // Analysis is synchronous end-to-end (no polling endpoint, unlike
    // recon), but still gets a JobStore record for the same audit trail -
    // created running rather than queued since there's no admission wait.
    let job = Job::new(request.product_id.clone(), JobKind::Analysis, request.image_refs.len() as u32);
    if let Err(e) = state.job_store.create(&job).await {
        tracing::warn!(product_id = %request.product_id, error = %e, "failed to create analysis job record");
    } else if let Err(e) = state.job_store.mark_running(&request.product_id).await {
        tracing::warn!(product_id = %request.product_id, error = %e, "failed to mark analysis job running");
    }

    let batch_config = BatchConfig {
        batch_size: state.config.batch_size,
        pace: Duration::from_secs(state.config.pace_seconds),
        deadline: Duration::from_secs(state.config.inner_deadline_secs),
        max_long_edge: marketplace_protocol::defaults::DEFAULT_ANALYSIS_IMAGE_SIZE,
        jpeg_quality: state.config.analysis_jpeg_quality,
    };

    let outcome = analyze_product(
        state.object_store.as_ref(),
        state.analyzer.as_ref(),
        &request.product_id,
        request.product_name.as_deref(),
        &request.image_refs,
        batch_config,
        Duration::from_secs(state.config.outer_deadline_secs),
    )
    .await;

    if let Err(e) = state.job_store.mark_done(&request.product_id, "aggregate").await {
        tracing::warn!(product_id = %request.product_id, error = %e, "failed to mark analysis job done");
    }

    let reconciler = marketplace_orchestrator::StatusReconciler::new(&state.external_mirror);
    if let Err(e) = reconciler.on_analysis_done(&outcome.aggregate).await {
        tracing::warn!(product_id = %request.product_id, error = %e, "failed to mirror analysis result");
    }

    for image_verdict in &outcome.verdicts {
        let per_image_markdown = format!(
            "- {} ({}건의 결함, 신뢰도 {:.0}%)",
            image_verdict.condition,
            image_verdict.defects.len(),
            image_verdict.confidence * 100.0
        );
        if let Err(e) = state
            .external_mirror
            .record_image_fault_description(
                &request.product_id,
                &image_verdict.image_ref,
                image_verdict.condition,
                image_verdict.price_adjustment,
                &image_verdict.defects,
                &per_image_markdown,
            )
            .await
        {
            tracing::warn!(product_id = %request.product_id, image_ref = %image_verdict.image_ref, error = %e, "failed to mirror per-image fault description");
        }
    }

    let verdict = &outcome.aggregate;
    let response = FaultDescResponse {
        product_id: verdict.product_id.clone(),
        inspection_results: outcome.verdicts.clone(),
        aggregated_condition: verdict.condition.to_string(),
        aggregated_price_adjustment: verdict.price_adjustment,
        total_defects_count: verdict.total_defects,
        markdown_summary: verdict.markdown.clone(),
        completed_at: verdict.completed_at.to_rfc3339(),
    };
    Ok(Json(response))
}

pub async fn analyze_desc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalyzeDescRequest>,
) -> Result<Json<AnalyzeDescResponse>, ApiError> {
    let description = generate_description(
        state.object_store.as_ref(),
        state.describer.as_ref(),
        &request.image_ref,
        &request.product_name,
    )
    .await
    .map_err(|e| ApiError::Internal(e.into()))?;

    Ok(Json(AnalyzeDescResponse { description }))
}
