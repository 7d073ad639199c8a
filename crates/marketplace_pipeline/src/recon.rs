//! The 3D-reconstruction pipeline: COLMAP feature extraction through
//! Gaussian-splat training to a downsampled PLY export, run as a sequence of
//! cancellable, logged subprocess stages.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use marketplace_protocol::defaults::{DEFAULT_MIN_POINTS_3D, DEFAULT_MIN_REGISTERED_IMAGES};
use marketplace_protocol::types::ReconStage;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::cancel::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ReconError {
    #[error("cancelled")]
    Cancelled,
    #[error("stage {stage} timed out after {elapsed_secs}s")]
    Timeout { stage: ReconStage, elapsed_secs: u64 },
    #[error("stage {stage} exited with {exit_code:?}: {stderr_tail}")]
    StageFailed {
        stage: ReconStage,
        exit_code: Option<i32>,
        stderr_tail: String,
    },
    #[error("reconstruction quality insufficient: {0}")]
    InsufficientReconstruction(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One executable step of the recon pipeline. A trait so tests can swap in a
/// fake that doesn't actually shell out to COLMAP/gsplat binaries.
#[async_trait::async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, stage: ReconStage, job_dir: &Path, log: &mut ProcessLog) -> Result<(), ReconError>;
}

/// Appends timestamped lines to a job's on-disk process log, mirroring the
/// original pipeline's `process.log` file, which `GET /recon/jobs/{id}/status`
/// tails for `log_tail`.
pub struct ProcessLog {
    file: fs::File,
}

impl ProcessLog {
    pub async fn create(job_dir: &Path) -> std::io::Result<Self> {
        let log_dir = job_dir.join("logs");
        fs::create_dir_all(&log_dir).await?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("process.log"))
            .await?;
        Ok(Self { file })
    }

    pub async fn line(&mut self, text: &str) -> std::io::Result<()> {
        self.file.write_all(text.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.file.flush().await
    }
}

/// Subprocess-backed stage runner: invokes the named COLMAP/gsplat binary
/// with `args`, with a per-stage wall-clock timeout.
pub struct SubprocessStageRunner {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[async_trait::async_trait]
impl StageRunner for SubprocessStageRunner {
    async fn run(&self, stage: ReconStage, job_dir: &Path, log: &mut ProcessLog) -> Result<(), ReconError> {
        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .current_dir(job_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn()?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ReconError::Timeout {
                    stage,
                    elapsed_secs: self.timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            let stderr_tail = String::from_utf8_lossy(&output.stderr)
                .lines()
                .rev()
                .take(10)
                .collect::<Vec<_>>()
                .join("\n");
            log.line(&format!(">> [{stage}] failed: {stderr_tail}")).await?;
            return Err(ReconError::StageFailed {
                stage,
                exit_code: output.status.code(),
                stderr_tail,
            });
        }

        Ok(())
    }
}

/// Summary of a COLMAP sparse reconstruction, used by the validate stage's
/// pass/fail threshold check.
#[derive(Debug, Clone, Copy)]
pub struct ColmapStats {
    pub registered_images: u32,
    pub points_3d: u32,
}

impl ColmapStats {
    pub fn is_sufficient(&self) -> bool {
        self.registered_images >= DEFAULT_MIN_REGISTERED_IMAGES && self.points_3d >= DEFAULT_MIN_POINTS_3D
    }

    pub fn summary(&self) -> String {
        format!(
            "registered_images={} points_3d={}",
            self.registered_images, self.points_3d
        )
    }
}

/// Callback invoked between stages, so the caller (the orchestrator, via
/// JobStore) can persist stage/progress without this crate depending on
/// `marketplace_db`.
#[async_trait::async_trait]
pub trait StageObserver: Send + Sync {
    async fn on_stage_start(&self, stage: ReconStage);
    async fn on_stage_done(&self, stage: ReconStage);
}

pub struct ReconPipeline<'a> {
    runner: &'a dyn StageRunner,
    observer: &'a dyn StageObserver,
}

impl<'a> ReconPipeline<'a> {
    pub fn new(runner: &'a dyn StageRunner, observer: &'a dyn StageObserver) -> Self {
        Self { runner, observer }
    }

    /// Run every stage in [`ReconStage::ORDERED`] in order, stopping at the
    /// first failure or cancellation. `colmap_stats` is supplied by the
    /// caller after `ColmapMap` runs (it parses the COLMAP database), and is
    /// checked at `ColmapValidate`.
    pub async fn run(
        &self,
        job_dir: &Path,
        token: &CancellationToken,
        colmap_stats: impl Fn() -> Option<ColmapStats>,
    ) -> Result<(), ReconError> {
        let mut log = ProcessLog::create(job_dir).await?;
        log.line(&format!(">> [job] starting reconstruction pipeline in {}", job_dir.display()))
            .await?;

        for stage in ReconStage::ORDERED {
            if token.is_cancelled() {
                log.line(">> [job] cancelled").await?;
                return Err(ReconError::Cancelled);
            }

            self.observer.on_stage_start(stage).await;
            log.line(&format!(">> [{stage}] starting")).await?;
            self.runner.run(stage, job_dir, &mut log).await?;

            if stage == ReconStage::ColmapValidate {
                if let Some(stats) = colmap_stats() {
                    log.line(&format!(">> [colmap_validate] {}", stats.summary())).await?;
                    if !stats.is_sufficient() {
                        let message = format!(
                            "reconstruction quality is insufficient for training ({})",
                            stats.summary()
                        );
                        log.line(&format!(">> [colmap_validate] {message}")).await?;
                        return Err(ReconError::InsufficientReconstruction(message));
                    }
                }
            }

            log.line(&format!(">> [{stage}] done")).await?;
            self.observer.on_stage_done(stage).await;
        }

        log.line(">> [SUCCESS] reconstruction pipeline complete").await?;
        Ok(())
    }
}

/// Downsample a PLY point cloud to `fraction` of its vertices, writing the
/// result to `dest`. Used to produce the `medium` (20%) and `light` (5%)
/// quality tiers alongside the full-resolution export.
pub async fn downsample_ply(source: &Path, dest: &Path, fraction: f64) -> Result<(), ReconError> {
    let bytes = fs::read(source).await?;
    let downsampled = downsample_ply_bytes(&bytes, fraction)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(dest, downsampled).await?;
    Ok(())
}

/// Parse a simple ASCII PLY header + vertex block and keep every Nth vertex
/// so the kept fraction is approximately `fraction`. Non-vertex-list content
/// (header, other elements) passes through untouched.
fn downsample_ply_bytes(bytes: &[u8], fraction: f64) -> Result<Vec<u8>, ReconError> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines();
    let mut header = Vec::new();
    let mut vertex_count = 0usize;
    let mut header_done = false;

    for line in &mut lines {
        header.push(line.to_string());
        if let Some(rest) = line.strip_prefix("element vertex ") {
            vertex_count = rest.trim().parse().unwrap_or(0);
        }
        if line.trim() == "end_header" {
            header_done = true;
            break;
        }
    }

    if !header_done {
        warn!("PLY file has no end_header marker, writing through unchanged");
        return Ok(bytes.to_vec());
    }

    let stride = (1.0 / fraction.clamp(0.01, 1.0)).round().max(1.0) as usize;
    let kept_vertices: Vec<&str> = lines.by_ref().take(vertex_count).step_by(stride).collect();

    let mut out_header = header.clone();
    for line in out_header.iter_mut() {
        if let Some(rest) = line.strip_prefix("element vertex ") {
            let _ = rest;
            *line = format!("element vertex {}", kept_vertices.len());
        }
    }

    let mut out = out_header.join("\n");
    out.push('\n');
    out.push_str(&kept_vertices.join("\n"));
    out.push('\n');
    Ok(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct CountingRunner {
        calls: Arc<AtomicUsize>,
        fail_at: Option<ReconStage>,
    }

    #[async_trait::async_trait]
    impl StageRunner for CountingRunner {
        async fn run(&self, stage: ReconStage, _job_dir: &Path, _log: &mut ProcessLog) -> Result<(), ReconError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if Some(stage) == self.fail_at {
                return Err(ReconError::StageFailed {
                    stage,
                    exit_code: Some(1),
                    stderr_tail: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    struct NoopObserver;

    #[async_trait::async_trait]
    impl StageObserver for NoopObserver {
        async fn on_stage_start(&self, _stage: ReconStage) {}
        async fn on_stage_done(&self, _stage: ReconStage) {}
    }

    #[tokio::test]
    async fn runs_every_stage_in_order_on_success() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = CountingRunner { calls: calls.clone(), fail_at: None };
        let observer = NoopObserver;
        let pipeline = ReconPipeline::new(&runner, &observer);

        let result = pipeline
            .run(dir.path(), &CancellationToken::new(), || {
                Some(ColmapStats { registered_images: 10, points_3d: 500 })
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), ReconStage::ORDERED.len());
    }

    #[tokio::test]
    async fn stops_at_first_stage_failure() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = CountingRunner {
            calls: calls.clone(),
            fail_at: Some(ReconStage::ColmapMatch),
        };
        let observer = NoopObserver;
        let pipeline = ReconPipeline::new(&runner, &observer);

        let result = pipeline
            .run(dir.path(), &CancellationToken::new(), || None)
            .await;

        assert!(matches!(result, Err(ReconError::StageFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_the_next_stage() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = CountingRunner { calls: calls.clone(), fail_at: None };
        let observer = NoopObserver;
        let pipeline = ReconPipeline::new(&runner, &observer);
        let token = CancellationToken::new();
        token.cancel();

        let result = pipeline.run(dir.path(), &token, || None).await;
        assert!(matches!(result, Err(ReconError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn validate_stage_rejects_insufficient_reconstruction() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = CountingRunner { calls: calls.clone(), fail_at: None };
        let observer = NoopObserver;
        let pipeline = ReconPipeline::new(&runner, &observer);

        let result = pipeline
            .run(dir.path(), &CancellationToken::new(), || {
                Some(ColmapStats { registered_images: 1, points_3d: 5 })
            })
            .await;

        assert!(matches!(result, Err(ReconError::InsufficientReconstruction(_))));
    }

    #[test]
    fn colmap_stats_threshold_matches_defaults() {
        let stats = ColmapStats { registered_images: 3, points_3d: 100 };
        assert!(stats.is_sufficient());
        let stats = ColmapStats { registered_images: 2, points_3d: 100 };
        assert!(!stats.is_sufficient());
    }

    #[tokio::test]
    async fn downsample_keeps_roughly_requested_fraction() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("in.ply");
        let dest = dir.path().join("out.ply");

        let mut ply = String::from("ply\nformat ascii 1.0\nelement vertex 100\nproperty float x\nend_header\n");
        for i in 0..100 {
            ply.push_str(&format!("{i}.0 0.0 0.0\n"));
        }
        fs::write(&source, ply).await.unwrap();

        downsample_ply(&source, &dest, 0.2).await.unwrap();
        let out = fs::read_to_string(&dest).await.unwrap();
        assert!(out.contains("element vertex 20"));
    }
}
