//! Mirrors JobStore's authoritative state into the external system-of-record
//! the seller site reads from. Every write is idempotent so a reconciliation
//! pass can be safely retried after a crash mid-update.

use marketplace_protocol::types::{Job, JobKind, ProductVerdict};

use marketplace_db::ExternalMirror;

/// Abstraction over the external mirror so the orchestrator's reconciliation
/// logic can be tested without a real database.
#[async_trait::async_trait]
pub trait TerminalSink: Send + Sync {
    async fn recon_queued(&self, product_id: &str) -> marketplace_db::Result<()>;
    async fn recon_progress(&self, product_id: &str, stage: &str, progress: u8) -> marketplace_db::Result<()>;
    async fn recon_terminal(
        &self,
        product_id: &str,
        succeeded: bool,
        error_message: Option<&str>,
        ply_url: Option<&str>,
    ) -> marketplace_db::Result<()>;
    async fn analysis_terminal(&self, verdict: &ProductVerdict) -> marketplace_db::Result<()>;
}

#[async_trait::async_trait]
impl TerminalSink for ExternalMirror {
    async fn recon_queued(&self, product_id: &str) -> marketplace_db::Result<()> {
        self.record_recon_queued(product_id).await
    }

    async fn recon_progress(&self, product_id: &str, stage: &str, progress: u8) -> marketplace_db::Result<()> {
        self.record_recon_progress(product_id, stage, progress).await
    }

    async fn recon_terminal(
        &self,
        product_id: &str,
        succeeded: bool,
        error_message: Option<&str>,
        ply_url: Option<&str>,
    ) -> marketplace_db::Result<()> {
        self.record_recon_terminal(product_id, succeeded, error_message, ply_url).await
    }

    async fn analysis_terminal(&self, verdict: &ProductVerdict) -> marketplace_db::Result<()> {
        self.record_analysis_terminal(verdict).await
    }
}

/// Drives JobStore -> external-mirror reconciliation for a single job's
/// lifecycle transitions. Stateless; every call reads the current JobStore
/// row and mirrors it, so it's safe to call repeatedly.
pub struct StatusReconciler<'a> {
    sink: &'a dyn TerminalSink,
}

impl<'a> StatusReconciler<'a> {
    pub fn new(sink: &'a dyn TerminalSink) -> Self {
        Self { sink }
    }

    pub async fn on_queued(&self, product_id: &str, kind: JobKind) -> marketplace_db::Result<()> {
        if kind == JobKind::Recon {
            self.sink.recon_queued(product_id).await?;
        }
        Ok(())
    }

    pub async fn on_progress(&self, job: &Job) -> marketplace_db::Result<()> {
        if job.kind == JobKind::Recon {
            self.sink.recon_progress(&job.product_id, &job.stage, job.progress).await?;
        }
        Ok(())
    }

    pub async fn on_recon_done(&self, product_id: &str, ply_url: &str) -> marketplace_db::Result<()> {
        self.sink.recon_terminal(product_id, true, None, Some(ply_url)).await
    }

    pub async fn on_recon_failed(&self, product_id: &str, error_message: &str) -> marketplace_db::Result<()> {
        self.sink.recon_terminal(product_id, false, Some(error_message), None).await
    }

    pub async fn on_analysis_done(&self, verdict: &ProductVerdict) -> marketplace_db::Result<()> {
        self.sink.analysis_terminal(verdict).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use marketplace_protocol::types::Condition;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSink {
        queued_calls: AtomicUsize,
        terminal_calls: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait::async_trait]
    impl TerminalSink for FakeSink {
        async fn recon_queued(&self, _product_id: &str) -> marketplace_db::Result<()> {
            self.queued_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn recon_progress(&self, _product_id: &str, _stage: &str, _progress: u8) -> marketplace_db::Result<()> {
            Ok(())
        }
        async fn recon_terminal(
            &self,
            product_id: &str,
            succeeded: bool,
            _error_message: Option<&str>,
            _ply_url: Option<&str>,
        ) -> marketplace_db::Result<()> {
            self.terminal_calls.lock().unwrap().push((product_id.to_string(), succeeded));
            Ok(())
        }
        async fn analysis_terminal(&self, _verdict: &ProductVerdict) -> marketplace_db::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn queued_is_mirrored_only_for_recon_jobs() {
        let sink = FakeSink::default();
        let reconciler = StatusReconciler::new(&sink);

        reconciler.on_queued("p1", JobKind::Recon).await.unwrap();
        reconciler.on_queued("p2", JobKind::Analysis).await.unwrap();

        assert_eq!(sink.queued_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recon_done_and_failed_mirror_correct_outcome() {
        let sink = FakeSink::default();
        let reconciler = StatusReconciler::new(&sink);

        reconciler.on_recon_done("p1", "https://example/p1.ply").await.unwrap();
        reconciler.on_recon_failed("p2", "timed out").await.unwrap();

        let calls = sink.terminal_calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[("p1".to_string(), true), ("p2".to_string(), false)]);
    }

    #[tokio::test]
    async fn analysis_done_delegates_to_sink() {
        let sink = FakeSink::default();
        let reconciler = StatusReconciler::new(&sink);
        let verdict = ProductVerdict {
            product_id: "p3".to_string(),
            condition: Condition::B,
            price_adjustment: -10,
            total_defects: 1,
            markdown: "## ok".to_string(),
            completed_at: Utc::now(),
        };

        reconciler.on_analysis_done(&verdict).await.unwrap();
    }
}
