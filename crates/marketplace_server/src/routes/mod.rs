//! Assembles the axum `Router`: one route per endpoint in the external
//! interface, `TraceLayer`/`CorsLayer` wrapping the whole surface the way the
//! teacher's HTTP binaries layer their middleware.

pub mod analysis;
pub mod health;
pub mod recon;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/inspect/fault_desc", post(analysis::fault_desc))
        .route("/inspect/analyze_desc", post(analysis::analyze_desc))
        .route("/recon/jobs", post(recon::create_job))
        .route("/recon/jobs/{product_id}/status", get(recon::job_status))
        .route("/recon/queue", get(recon::queue_status))
        .route("/recon/pub/{product_id}/cloud.ply", get(recon::cloud_ply))
        .route("/v/{product_id}", get(recon::view))
        .route("/v/rotate/{product_id}", get(recon::view_rotate))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
