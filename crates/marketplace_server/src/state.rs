//! Shared application state handed to every axum handler: one JobStore per
//! pipeline kind (both backed by the same sqlite file - `kind` already
//! partitions them), the external mirror, both pipeline schedulers, and the
//! backend implementations the pipeline crate's traits are generic over.

use std::collections::HashMap;
use std::sync::Arc;

use marketplace_db::{ExternalMirror, JobStore};
use marketplace_orchestrator::Scheduler;
use marketplace_pipeline::{
    AnalyzerBackend, CancellationToken, DescribeBackend, HttpAnalyzer, HttpDescriber, ObjectStore,
};
use marketplace_protocol::types::JobKind;
use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::object_store::LocalObjectStore;

/// Shared state handed to every axum handler.
///
/// `active_tokens` tracks the cancellation token for every recon job
/// currently running in a spawned background task, keyed by `product_id`, so
/// the shutdown handler can flip all of them without reaching into the
/// pipeline task itself.
pub struct AppState {
    pub config: AppConfig,
    pub job_store: JobStore,
    pub external_mirror: ExternalMirror,
    pub recon_scheduler: Scheduler,
    pub object_store: Arc<dyn ObjectStore>,
    pub analyzer: Arc<dyn AnalyzerBackend>,
    pub describer: Arc<dyn DescribeBackend>,
    pub active_tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl AppState {
    pub fn new(config: AppConfig, job_store: JobStore, external_mirror: ExternalMirror) -> Self {
        let recon_scheduler = Scheduler::new(job_store.clone(), JobKind::Recon, config.max_concurrent_jobs);
        let object_store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(config.data_dir.join("uploads")));
        let analyzer: Arc<dyn AnalyzerBackend> = Arc::new(HttpAnalyzer::new(
            config.analyzer_endpoint.clone(),
            config.analyzer_api_key.clone(),
            config.analyzer_model.clone(),
        ));
        let describer: Arc<dyn DescribeBackend> = Arc::new(HttpDescriber::new(
            config.describer_endpoint.clone(),
            config.describer_api_key.clone(),
            config.describer_model.clone(),
        ));

        Self {
            config,
            job_store,
            external_mirror,
            recon_scheduler,
            object_store,
            analyzer,
            describer,
            active_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Register `token` under `product_id` for the duration of its recon run.
    pub async fn track_job(&self, product_id: String, token: CancellationToken) {
        self.active_tokens.lock().await.insert(product_id, token);
    }

    pub async fn untrack_job(&self, product_id: &str) {
        self.active_tokens.lock().await.remove(product_id);
    }

    /// Flip every in-flight job's cancellation token. Stages check the token
    /// before starting the next one, so running jobs finish their current
    /// stage and then stop rather than being killed mid-stage.
    pub async fn cancel_all_running(&self) {
        for token in self.active_tokens.lock().await.values() {
            token.cancel();
        }
    }
}
