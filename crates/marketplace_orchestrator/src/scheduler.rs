//! FIFO admission control for the recon pipeline: a bounded number of jobs
//! run concurrently, everything else waits in JobStore's `queued` state.
//!
//! Mirrors the original `asyncio.Semaphore(settings.MAX_CONCURRENT_JOBS)`
//! gate in front of `process_job` - same shape, `tokio::sync::Semaphore`
//! instead.

use std::sync::Arc;

use marketplace_protocol::defaults::DEFAULT_MAX_CONCURRENT_JOBS;
use marketplace_protocol::types::JobKind;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

use marketplace_db::JobStore;

/// Holds a claimed admission slot. Dropping it releases the slot back to the
/// scheduler, so the next queued job can be admitted.
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Clone)]
pub struct Scheduler {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    job_store: JobStore,
    kind: JobKind,
}

impl Scheduler {
    pub fn new(job_store: JobStore, kind: JobKind, max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            job_store,
            kind,
        }
    }

    pub fn with_defaults(job_store: JobStore, kind: JobKind) -> Self {
        Self::new(job_store, kind, DEFAULT_MAX_CONCURRENT_JOBS)
    }

    /// Block until an admission slot is free, then claim it. The caller
    /// should hold the returned permit for the job's entire execution.
    pub async fn admit(&self) -> AdmissionPermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        info!(kind = %self.kind, available = self.semaphore.available_permits(), "admitted job");
        AdmissionPermit { _permit: permit }
    }

    /// 1-based position of `product_id` in the pending queue, or `None` if
    /// it isn't currently queued.
    pub async fn queue_position(&self, product_id: &str) -> marketplace_db::Result<Option<usize>> {
        let pending = self.job_store.list_pending(self.kind).await?;
        Ok(pending
            .iter()
            .position(|job| job.product_id == product_id)
            .map(|idx| idx + 1))
    }

    pub fn running_count(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketplace_db::{ensure_jobstore_schema, open_sqlite_pool};
    use marketplace_protocol::types::Job;

    async fn scheduler(max_concurrent: usize) -> Scheduler {
        let pool = open_sqlite_pool("sqlite::memory:").await.unwrap();
        ensure_jobstore_schema(&pool).await.unwrap();
        Scheduler::new(JobStore::new(pool), JobKind::Recon, max_concurrent)
    }

    #[tokio::test]
    async fn admits_up_to_max_concurrent_then_blocks() {
        let scheduler = scheduler(2).await;
        let p1 = scheduler.admit().await;
        let p2 = scheduler.admit().await;
        assert_eq!(scheduler.running_count(), 2);

        let scheduler_clone = scheduler.clone();
        let admit_task = tokio::spawn(async move { scheduler_clone.admit().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!admit_task.is_finished());

        drop(p1);
        let _p3 = admit_task.await.unwrap();
        assert_eq!(scheduler.running_count(), 2);
        drop(p2);
    }

    #[tokio::test]
    async fn queue_position_reflects_fifo_order() {
        let scheduler = scheduler(1).await;
        for id in ["a", "b", "c"] {
            scheduler
                .job_store
                .create(&Job::new(id, JobKind::Recon, 5))
                .await
                .unwrap();
        }

        assert_eq!(scheduler.queue_position("a").await.unwrap(), Some(1));
        assert_eq!(scheduler.queue_position("c").await.unwrap(), Some(3));
        assert_eq!(scheduler.queue_position("missing").await.unwrap(), None);
    }
}
