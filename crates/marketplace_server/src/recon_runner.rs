//! Composes the reconstruction pipeline's pieces - image staging, the
//! COLMAP/gsplat stage runner, JobStore/external-mirror bookkeeping, and PLY
//! downsampling - into the single task spawned per accepted recon job.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use marketplace_db::JobStore;
use marketplace_orchestrator::error_policy::{classify_recon_error, error_message};
use marketplace_orchestrator::StatusReconciler;
use marketplace_pipeline::recon::SubprocessStageRunner;
use marketplace_pipeline::{
    downsample_ply, fetch_all_to_directory, CancellationToken, ColmapStats, ProcessLog, ReconPipeline,
    StageObserver, StageRunner,
};
use marketplace_protocol::defaults::{PLY_LIGHT_FRACTION, PLY_MEDIUM_FRACTION};
use marketplace_protocol::types::{ErrorKind, Job, ReconStage};
use tracing::{error, info, warn, Instrument};

use crate::state::AppState;

/// Dispatches each [`ReconStage`] to the right COLMAP/gsplat subcommand,
/// delegating the actual subprocess mechanics to [`SubprocessStageRunner`].
/// `ColmapValidate` has no subprocess of its own - it's a pass/fail check on
/// the sparse reconstruction COLMAP already produced at `ColmapMap`.
pub struct MarketplaceStageRunner {
    pub colmap_binary: PathBuf,
    pub gsplat_binary: PathBuf,
    pub iterations: u32,
    pub stage_timeout: Duration,
}

impl MarketplaceStageRunner {
    fn subprocess(&self, binary: &Path, args: &[&str]) -> SubprocessStageRunner {
        SubprocessStageRunner {
            binary: binary.to_path_buf(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout: self.stage_timeout,
        }
    }
}

#[async_trait]
impl StageRunner for MarketplaceStageRunner {
    async fn run(
        &self,
        stage: ReconStage,
        job_dir: &Path,
        log: &mut ProcessLog,
    ) -> Result<(), marketplace_pipeline::recon::ReconError> {
        match stage {
            ReconStage::ColmapFeatures => {
                self.subprocess(
                    &self.colmap_binary,
                    &["feature_extractor", "--database_path", "work/database.db", "--image_path", "upload/images"],
                )
                .run(stage, job_dir, log)
                .await
            }
            ReconStage::ColmapMatch => {
                self.subprocess(&self.colmap_binary, &["exhaustive_matcher", "--database_path", "work/database.db"])
                    .run(stage, job_dir, log)
                    .await
            }
            ReconStage::ColmapMap => {
                self.subprocess(
                    &self.colmap_binary,
                    &[
                        "mapper",
                        "--database_path",
                        "work/database.db",
                        "--image_path",
                        "upload/images",
                        "--output_path",
                        "work/sparse",
                    ],
                )
                .run(stage, job_dir, log)
                .await
            }
            ReconStage::ColmapUndistort => {
                self.subprocess(
                    &self.colmap_binary,
                    &[
                        "image_undistorter",
                        "--image_path",
                        "upload/images",
                        "--input_path",
                        "work/sparse/0",
                        "--output_path",
                        "work/dense",
                    ],
                )
                .run(stage, job_dir, log)
                .await
            }
            ReconStage::ColmapValidate => Ok(()),
            ReconStage::GsTrain => {
                let iterations = self.iterations.to_string();
                self.subprocess(
                    &self.gsplat_binary,
                    &["--source_path", "work/dense", "--iterations", &iterations, "--model_path", "output"],
                )
                .run(stage, job_dir, log)
                .await
            }
            ReconStage::ExportPly | ReconStage::Done | ReconStage::Error => Ok(()),
        }
    }
}

/// Read a COLMAP sparse model's `images.txt`/`points3D.txt` to count
/// registered images and 3D points for the validate-stage threshold check.
/// Both files follow COLMAP's documented plain-text format: a `#`-prefixed
/// comment header followed by one data record per line (images.txt uses two
/// lines per image - a pose line and a point-observations line).
pub fn parse_colmap_stats(job_dir: &Path) -> Option<ColmapStats> {
    let sparse_dir = job_dir.join("work/sparse/0");
    let images_path = sparse_dir.join("images.txt");
    let points_path = sparse_dir.join("points3D.txt");

    let images_text = std::fs::read_to_string(&images_path).ok()?;
    let data_lines: Vec<&str> = images_text.lines().filter(|l| !l.trim_start().starts_with('#') && !l.trim().is_empty()).collect();
    let registered_images = (data_lines.len() / 2) as u32;

    let points_text = std::fs::read_to_string(&points_path).ok()?;
    let points_3d = points_text
        .lines()
        .filter(|l| !l.trim_start().starts_with('#') && !l.trim().is_empty())
        .count() as u32;

    Some(ColmapStats { registered_images, points_3d })
}

/// World-space position of the first registered camera in a COLMAP sparse
/// model, rotated 180 degrees about the vertical axis to match the viewer's
/// coordinate convention. `images.txt`'s pose lines give `(qw, qx, qy, qz,
/// tx, ty, tz)` for the world-to-camera transform; the camera center in
/// world space is `-R^T * t`, per COLMAP's documented model format.
pub fn first_camera_position(job_dir: &Path) -> Option<(f64, f64, f64)> {
    let images_path = job_dir.join("work/sparse/0/images.txt");
    let text = std::fs::read_to_string(images_path).ok()?;
    let pose_line = text
        .lines()
        .find(|l| !l.trim_start().starts_with('#') && !l.trim().is_empty())?;

    let fields: Vec<&str> = pose_line.split_whitespace().collect();
    if fields.len() < 8 {
        return None;
    }
    let qw: f64 = fields[1].parse().ok()?;
    let qx: f64 = fields[2].parse().ok()?;
    let qy: f64 = fields[3].parse().ok()?;
    let qz: f64 = fields[4].parse().ok()?;
    let tx: f64 = fields[5].parse().ok()?;
    let ty: f64 = fields[6].parse().ok()?;
    let tz: f64 = fields[7].parse().ok()?;

    // Quaternion to rotation matrix (world-to-camera).
    let r = [
        [
            1.0 - 2.0 * (qy * qy + qz * qz),
            2.0 * (qx * qy - qz * qw),
            2.0 * (qx * qz + qy * qw),
        ],
        [
            2.0 * (qx * qy + qz * qw),
            1.0 - 2.0 * (qx * qx + qz * qz),
            2.0 * (qy * qz - qx * qw),
        ],
        [
            2.0 * (qx * qz - qy * qw),
            2.0 * (qy * qz + qx * qw),
            1.0 - 2.0 * (qx * qx + qy * qy),
        ],
    ];

    // Camera center = -R^T * t.
    let cx = -(r[0][0] * tx + r[1][0] * ty + r[2][0] * tz);
    let cy = -(r[0][1] * tx + r[1][1] * ty + r[2][1] * tz);
    let cz = -(r[0][2] * tx + r[1][2] * ty + r[2][2] * tz);

    // Rotate 180 degrees about the vertical axis for the viewer's convention.
    Some((-cx, cy, -cz))
}

/// Mirrors stage transitions into JobStore and the external DB as the
/// pipeline advances. Re-reads the job row after each update so the
/// reconciler always sees JobStore's authoritative state, not a value
/// reconstructed by hand.
struct JobProgressObserver {
    job_store: JobStore,
    external_mirror: marketplace_db::ExternalMirror,
    product_id: String,
}

impl JobProgressObserver {
    async fn mirror_progress(&self) {
        match self.job_store.get(&self.product_id).await {
            Ok(job) => {
                let reconciler = StatusReconciler::new(&self.external_mirror);
                if let Err(e) = reconciler.on_progress(&job).await {
                    warn!(product_id = %self.product_id, error = %e, "failed to mirror recon progress");
                }
            }
            Err(e) => warn!(product_id = %self.product_id, error = %e, "failed to reload job for progress mirror"),
        }
    }
}

#[async_trait]
impl StageObserver for JobProgressObserver {
    async fn on_stage_start(&self, stage: ReconStage) {
        if let Err(e) = self.job_store.set_stage(&self.product_id, &stage.to_string(), stage.progress()).await {
            warn!(product_id = %self.product_id, error = %e, "failed to persist stage start");
            return;
        }
        self.mirror_progress().await;
    }

    async fn on_stage_done(&self, _stage: ReconStage) {}
}

/// Run the full reconstruction job for `job`, from image staging through
/// terminal JobStore/external-mirror bookkeeping. Spawned as a background
/// task once a job clears admission control; never panics on pipeline
/// failure, only on a JobStore write it cannot recover from.
pub async fn run_recon_job(state: Arc<AppState>, job: Job, s3_images: Vec<String>, token: CancellationToken) {
    let product_id = job.product_id.clone();
    let span = tracing::info_span!("recon_job", product_id = %product_id, kind = %job.kind);

    async move {
        let _permit = state.recon_scheduler.admit().await;

        if !state.job_store.mark_running(&product_id).await.unwrap_or(false) {
            warn!("job was not in queued state at admission, skipping");
            return;
        }

        let job_dir = state.config.product_dir(&product_id);
        let images_dir = job_dir.join("upload/images");
        if let Err(e) = tokio::fs::create_dir_all(&images_dir).await {
            fail_job(&state, &product_id, ErrorKind::Internal, "stage", &e.to_string()).await;
            return;
        }

        let (staged, first_error) =
            fetch_all_to_directory(state.object_store.as_ref(), &s3_images, &images_dir, 4).await;
        if staged.is_empty() {
            let message = first_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no images could be staged".to_string());
            fail_job(&state, &product_id, ErrorKind::FetchFailed, "stage", &message).await;
            return;
        }
        if let Some(e) = first_error {
            warn!(product_id = %product_id, error = %e, "some images failed to stage, proceeding with the rest");
        }

        let iterations = job.iterations.unwrap_or(state.config.training_iterations);
        let runner = MarketplaceStageRunner {
            colmap_binary: state.config.colmap_binary.clone(),
            gsplat_binary: state.config.gsplat_binary.clone(),
            iterations,
            stage_timeout: Duration::from_secs(3600),
        };
        let observer = JobProgressObserver {
            job_store: state.job_store.clone(),
            external_mirror: state.external_mirror.clone(),
            product_id: product_id.clone(),
        };
        let pipeline = ReconPipeline::new(&runner, &observer);
        let result = pipeline.run(&job_dir, &token, || parse_colmap_stats(&job_dir)).await;

        match result {
            Ok(()) => finish_recon_job(&state, &product_id, &job_dir, iterations).await,
            Err(e) => {
                let kind = classify_recon_error(&e);
                fail_job(&state, &product_id, kind, "recon", &error_message(&e)).await;
            }
        }
    }
    .instrument(span)
    .await
}

async fn finish_recon_job(state: &Arc<AppState>, product_id: &str, job_dir: &Path, iterations: u32) {
    let iteration_dir = job_dir.join(format!("output/point_cloud/iteration_{iterations}"));
    let full_ply = iteration_dir.join("point_cloud.ply");
    let medium_ply = iteration_dir.join("point_cloud_medium.ply");
    let light_ply = iteration_dir.join("point_cloud_light.ply");

    if full_ply.exists() {
        if let Err(e) = downsample_ply(&full_ply, &medium_ply, PLY_MEDIUM_FRACTION).await {
            warn!(product_id, error = %e, "failed to produce medium-quality ply tier");
        }
        if let Err(e) = downsample_ply(&full_ply, &light_ply, PLY_LIGHT_FRACTION).await {
            warn!(product_id, error = %e, "failed to produce light-quality ply tier");
        }
    } else {
        warn!(product_id, "gaussian-splat training produced no point_cloud.ply");
    }

    if let Err(e) = state.job_store.mark_done(product_id, "done").await {
        error!(product_id, error = %e, "failed to record job completion");
        return;
    }

    let ply_url = format!("{}/recon/pub/{}/cloud.ply", state.config.base_url, product_id);
    let reconciler = StatusReconciler::new(&state.external_mirror);
    if let Err(e) = reconciler.on_recon_done(product_id, &ply_url).await {
        warn!(product_id, error = %e, "failed to mirror recon completion");
    }
    info!(product_id, "reconstruction job complete");
}

async fn fail_job(state: &Arc<AppState>, product_id: &str, kind: ErrorKind, stage: &str, message: &str) {
    if let Err(e) = state.job_store.mark_failed(product_id, kind, stage, message).await {
        error!(product_id, error = %e, "failed to record job failure");
    }
    let reconciler = StatusReconciler::new(&state.external_mirror);
    if let Err(e) = reconciler.on_recon_failed(product_id, message).await {
        warn!(product_id, error = %e, "failed to mirror recon failure");
    }
    error!(product_id, %kind, message, "reconstruction job failed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_colmap_stats_counts_image_pairs_and_points() {
        let dir = tempfile::tempdir().unwrap();
        let sparse = dir.path().join("work/sparse/0");
        std::fs::create_dir_all(&sparse).unwrap();
        std::fs::write(
            sparse.join("images.txt"),
            "# comment\n1 0 0 0 1 0 0 0 1 img1.jpg\nPOINTS2D\n2 0 0 0 1 0 0 0 1 img2.jpg\nPOINTS2D\n",
        )
        .unwrap();
        std::fs::write(sparse.join("points3D.txt"), "# comment\n1 0 0 0\n2 0 0 0\n3 0 0 0\n").unwrap();

        let stats = parse_colmap_stats(dir.path()).unwrap();
        assert_eq!(stats.registered_images, 2);
        assert_eq!(stats.points_3d, 3);
    }

    #[test]
    fn first_camera_position_inverts_identity_pose_and_rotates_180() {
        let dir = tempfile::tempdir().unwrap();
        let sparse = dir.path().join("work/sparse/0");
        std::fs::create_dir_all(&sparse).unwrap();
        // Identity rotation (qw=1), translation (1, 2, 3): camera center is
        // -t = (-1, -2, -3) before the viewer's 180-degree flip.
        std::fs::write(
            sparse.join("images.txt"),
            "# comment\n1 1 0 0 0 1 2 3 1 img1.jpg\nPOINTS2D\n",
        )
        .unwrap();

        let (x, y, z) = first_camera_position(dir.path()).unwrap();
        assert!((x - 1.0).abs() < 1e-9);
        assert!((y - -2.0).abs() < 1e-9);
        assert!((z - 3.0).abs() < 1e-9);
    }

    #[test]
    fn first_camera_position_returns_none_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(first_camera_position(dir.path()).is_none());
    }

    #[test]
    fn parse_colmap_stats_returns_none_when_files_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(parse_colmap_stats(dir.path()).is_none());
    }
}
