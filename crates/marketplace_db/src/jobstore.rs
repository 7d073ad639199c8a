//! JobStore: the orchestrator's authoritative record of in-flight and
//! completed jobs. Single-writer-per-job - only the executor that owns a
//! product's job may call the mutating methods for that product_id.

use chrono::{DateTime, Utc};
use marketplace_protocol::defaults::LOG_TAIL_CAPACITY;
use marketplace_protocol::types::{ErrorKind, Job, JobKind, JobStatus, ReconStage};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use tracing::info;

use crate::error::{DbError, Result};

#[derive(Debug, FromRow)]
struct JobRow {
    product_id: String,
    kind: String,
    status: String,
    stage: String,
    progress: i64,
    image_count: i64,
    iterations: Option<i64>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_kind: Option<String>,
    error_stage: Option<String>,
    error_message: Option<String>,
    log_tail: String,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let parse_ts = |s: &str| -> Result<DateTime<Utc>> {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| DbError::NotFound(format!("bad timestamp {s}: {e}")))
        };
        Ok(Job {
            product_id: self.product_id,
            kind: JobKind::from_str(&self.kind).map_err(|e| DbError::NotFound(e.to_string()))?,
            status: JobStatus::from_str(&self.status)
                .map_err(|e| DbError::NotFound(e.to_string()))?,
            stage: self.stage,
            progress: self.progress as u8,
            image_count: self.image_count as u32,
            iterations: self.iterations.map(|n| n as u32),
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            error_kind: self
                .error_kind
                .as_deref()
                .map(|s| match s {
                    "input_invalid" => Ok(ErrorKind::InputInvalid),
                    "fetch_failed" => Ok(ErrorKind::FetchFailed),
                    "upstream_rate_limited" => Ok(ErrorKind::UpstreamRateLimited),
                    "upstream_transient" => Ok(ErrorKind::UpstreamTransient),
                    "pipeline_stage_failed" => Ok(ErrorKind::PipelineStageFailed),
                    "insufficient_reconstruction" => Ok(ErrorKind::InsufficientReconstruction),
                    "timeout" => Ok(ErrorKind::Timeout),
                    "shutdown" => Ok(ErrorKind::Shutdown),
                    "internal" => Ok(ErrorKind::Internal),
                    other => Err(DbError::NotFound(format!("unknown error_kind {other}"))),
                })
                .transpose()?,
            error_stage: self.error_stage,
            error_message: self.error_message,
            log_tail: serde_json::from_str(&self.log_tail).unwrap_or_default(),
        })
    }
}

/// Sqlite-backed JobStore.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a freshly created job. Errors if `product_id` already has a job.
    pub async fn create(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO jobs
                (product_id, kind, status, stage, progress, image_count, iterations,
                 created_at, started_at, completed_at, error_kind, error_stage,
                 error_message, log_tail)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&job.product_id)
        .bind(job.kind.to_string())
        .bind(job.status.to_string())
        .bind(&job.stage)
        .bind(job.progress as i64)
        .bind(job.image_count as i64)
        .bind(job.iterations.map(|n| n as i64))
        .bind(job.created_at.to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(job.error_kind.map(|k| k.to_string()))
        .bind(&job.error_stage)
        .bind(&job.error_message)
        .bind(serde_json::to_string(&job.log_tail).unwrap_or_else(|_| "[]".to_string()))
        .execute(&self.pool)
        .await?;

        info!(product_id = %job.product_id, kind = %job.kind, "job created");
        Ok(())
    }

    pub async fn get(&self, product_id: &str) -> Result<Job> {
        let row: JobRow = sqlx::query_as("SELECT * FROM jobs WHERE product_id = ?")
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(product_id.to_string()))?;
        row.into_job()
    }

    /// Atomically transition a queued job to running, recording `started_at`.
    /// Returns `false` (no rows affected) if the job wasn't in `queued`.
    pub async fn mark_running(&self, product_id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let affected = sqlx::query(
            r#"UPDATE jobs SET status = 'running', started_at = ?
               WHERE product_id = ? AND status = 'queued'"#,
        )
        .bind(&now)
        .bind(product_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Update the current stage and progress checkpoint for a running job.
    ///
    /// When both the current and the new stage are recognized
    /// [`ReconStage`] labels, enforces the forward-only transition rule from
    /// the ordering guarantees: a job's `stage` may only advance or move to
    /// `error`, never regress. Free-form stage labels outside that closed
    /// set (e.g. the analysis pipeline's) pass through unchecked.
    pub async fn set_stage(&self, product_id: &str, stage: &str, progress: u8) -> Result<()> {
        let current = self.get(product_id).await?;
        if let (Ok(from), Ok(to)) = (current.stage.parse::<ReconStage>(), stage.parse::<ReconStage>()) {
            if !from.can_advance_to(to) {
                return Err(DbError::InvalidStageTransition {
                    product_id: product_id.to_string(),
                    from: current.stage,
                    to: stage.to_string(),
                });
            }
        }

        sqlx::query("UPDATE jobs SET stage = ?, progress = ? WHERE product_id = ?")
            .bind(stage)
            .bind(progress as i64)
            .bind(product_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append a line to the job's bounded in-memory log tail, keeping only
    /// the most recent `LOG_TAIL_CAPACITY` lines.
    pub async fn append_log_line(&self, product_id: &str, line: &str) -> Result<()> {
        let job = self.get(product_id).await?;
        let mut tail = job.log_tail;
        tail.push(line.to_string());
        if tail.len() > LOG_TAIL_CAPACITY {
            let excess = tail.len() - LOG_TAIL_CAPACITY;
            tail.drain(0..excess);
        }
        sqlx::query("UPDATE jobs SET log_tail = ? WHERE product_id = ?")
            .bind(serde_json::to_string(&tail).unwrap_or_else(|_| "[]".to_string()))
            .bind(product_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a job done, recording final stage/progress and completion time.
    pub async fn mark_done(&self, product_id: &str, stage: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"UPDATE jobs SET status = 'done', stage = ?, progress = 100, completed_at = ?
               WHERE product_id = ?"#,
        )
        .bind(stage)
        .bind(&now)
        .bind(product_id)
        .execute(&self.pool)
        .await?;
        info!(product_id, "job done");
        Ok(())
    }

    /// Mark a job failed, recording the classified error.
    pub async fn mark_failed(
        &self,
        product_id: &str,
        error_kind: ErrorKind,
        error_stage: &str,
        error_message: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"UPDATE jobs SET status = 'failed', completed_at = ?,
                 error_kind = ?, error_stage = ?, error_message = ?
               WHERE product_id = ?"#,
        )
        .bind(&now)
        .bind(error_kind.to_string())
        .bind(error_stage)
        .bind(error_message)
        .bind(product_id)
        .execute(&self.pool)
        .await?;
        info!(product_id, %error_kind, "job failed");
        Ok(())
    }

    pub async fn list_pending(&self, kind: JobKind) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM jobs WHERE kind = ? AND status = 'queued' ORDER BY created_at ASC",
        )
        .bind(kind.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    pub async fn list_running(&self, kind: JobKind) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> =
            sqlx::query_as("SELECT * FROM jobs WHERE kind = ? AND status = 'running'")
                .bind(kind.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::open_sqlite_pool;
    use crate::schema::ensure_jobstore_schema;

    async fn store() -> JobStore {
        let pool = open_sqlite_pool("sqlite::memory:").await.unwrap();
        ensure_jobstore_schema(&pool).await.unwrap();
        JobStore::new(pool)
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let store = store().await;
        let job = Job::new("prod-1", JobKind::Recon, 8);
        store.create(&job).await.unwrap();

        let fetched = store.get("prod-1").await.unwrap();
        assert_eq!(fetched.product_id, "prod-1");
        assert_eq!(fetched.status, JobStatus::Queued);
        assert_eq!(fetched.image_count, 8);
    }

    #[tokio::test]
    async fn mark_running_then_done_transitions() {
        let store = store().await;
        store
            .create(&Job::new("prod-2", JobKind::Analysis, 4))
            .await
            .unwrap();

        assert!(store.mark_running("prod-2").await.unwrap());
        // Can't re-claim a job that's already running.
        assert!(!store.mark_running("prod-2").await.unwrap());

        store.mark_done("prod-2", "done").await.unwrap();
        let job = store.get("prod-2").await.unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn mark_failed_records_classification() {
        let store = store().await;
        store
            .create(&Job::new("prod-3", JobKind::Recon, 5))
            .await
            .unwrap();
        store
            .mark_failed("prod-3", ErrorKind::Timeout, "gs_train", "deadline exceeded")
            .await
            .unwrap();

        let job = store.get("prod-3").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(job.error_stage.as_deref(), Some("gs_train"));
    }

    #[tokio::test]
    async fn append_log_line_truncates_to_capacity() {
        let store = store().await;
        store
            .create(&Job::new("prod-4", JobKind::Recon, 5))
            .await
            .unwrap();

        for i in 0..(LOG_TAIL_CAPACITY + 10) {
            store
                .append_log_line("prod-4", &format!("line {i}"))
                .await
                .unwrap();
        }

        let job = store.get("prod-4").await.unwrap();
        assert_eq!(job.log_tail.len(), LOG_TAIL_CAPACITY);
        assert_eq!(job.log_tail.last().unwrap(), &format!("line {}", LOG_TAIL_CAPACITY + 9));
    }

    #[tokio::test]
    async fn list_pending_excludes_running() {
        let store = store().await;
        store
            .create(&Job::new("prod-5", JobKind::Recon, 5))
            .await
            .unwrap();
        store
            .create(&Job::new("prod-6", JobKind::Recon, 5))
            .await
            .unwrap();
        store.mark_running("prod-6").await.unwrap();

        let pending = store.list_pending(JobKind::Recon).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].product_id, "prod-5");

        let running = store.list_running(JobKind::Recon).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].product_id, "prod-6");
    }

    #[tokio::test]
    async fn set_stage_advances_through_recon_stages() {
        let store = store().await;
        store.create(&Job::new("prod-7", JobKind::Recon, 5)).await.unwrap();

        store.set_stage("prod-7", "colmap_features", 15).await.unwrap();
        store.set_stage("prod-7", "colmap_match", 30).await.unwrap();
        let job = store.get("prod-7").await.unwrap();
        assert_eq!(job.stage, "colmap_match");
        assert_eq!(job.progress, 30);
    }

    #[tokio::test]
    async fn set_stage_rejects_regression_between_recognized_recon_stages() {
        let store = store().await;
        store.create(&Job::new("prod-8", JobKind::Recon, 5)).await.unwrap();
        store.set_stage("prod-8", "colmap_map", 45).await.unwrap();

        let result = store.set_stage("prod-8", "colmap_features", 15).await;
        assert!(matches!(result, Err(DbError::InvalidStageTransition { .. })));

        // The rejected write must not have taken effect.
        let job = store.get("prod-8").await.unwrap();
        assert_eq!(job.stage, "colmap_map");
    }

    #[tokio::test]
    async fn set_stage_passes_through_free_form_labels_outside_recon_stage_set() {
        let store = store().await;
        store.create(&Job::new("prod-9", JobKind::Analysis, 2)).await.unwrap();

        // "queued" and "aggregate" aren't ReconStage labels, so no
        // monotonicity check applies to the analysis pipeline's stages.
        store.set_stage("prod-9", "aggregate", 100).await.unwrap();
        let job = store.get("prod-9").await.unwrap();
        assert_eq!(job.stage, "aggregate");
    }
}
