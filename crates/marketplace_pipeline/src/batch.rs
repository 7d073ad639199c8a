//! Fans a product's images out to the analyzer in small batches, running
//! each batch concurrently while respecting the upstream's rate limit with
//! an inter-batch pace, and bailing out once the soft deadline has elapsed.

use std::time::{Duration, Instant};

use marketplace_protocol::defaults::{
    DEFAULT_BATCH_SIZE, DEFAULT_INNER_DEADLINE_SECS, DEFAULT_PACE_SECONDS,
};
use marketplace_protocol::types::ImageVerdict;
use tracing::warn;

use crate::analyzer::{AnalyzeRequest, AnalyzerBackend, AnalyzerError};
use crate::fetch::{fetch_and_recompress, FetchError, ObjectStore};

/// Outcome of fanning a product's images out through the analyzer: the
/// verdicts obtained (including per-image JSON-parse fallbacks, which count
/// as successes per the analyzer's contract), how many images hit a hard
/// upstream/fetch error, how many were never attempted because the deadline
/// hit first, and whether the deadline was the reason the run ended early.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub verdicts: Vec<ImageVerdict>,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub timed_out: bool,
}

pub struct BatchConfig {
    pub batch_size: usize,
    pub pace: Duration,
    /// Soft deadline: checked before each batch starts. Does not interrupt
    /// a batch already in flight. The hard outer timeout that can interrupt
    /// mid-batch is the caller's responsibility (see [`crate::analysis`]).
    pub deadline: Duration,
    pub max_long_edge: u32,
    pub jpeg_quality: u8,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            pace: Duration::from_secs(DEFAULT_PACE_SECONDS),
            deadline: Duration::from_secs(DEFAULT_INNER_DEADLINE_SECS),
            max_long_edge: marketplace_protocol::defaults::DEFAULT_ANALYSIS_IMAGE_SIZE,
            jpeg_quality: marketplace_protocol::defaults::DEFAULT_ANALYSIS_JPEG_QUALITY,
        }
    }
}

pub struct BatchAnalyzer<'a> {
    store: &'a dyn ObjectStore,
    backend: &'a dyn AnalyzerBackend,
    config: BatchConfig,
}

impl<'a> BatchAnalyzer<'a> {
    pub fn new(store: &'a dyn ObjectStore, backend: &'a dyn AnalyzerBackend, config: BatchConfig) -> Self {
        Self { store, backend, config }
    }

    /// Analyze every image in `image_refs`, running each batch of
    /// `config.batch_size` images concurrently and pacing batches
    /// `config.pace` apart to respect the upstream rate limit. Stops before
    /// starting a new batch once `config.deadline` has elapsed, recording
    /// the remaining images as skipped rather than attempting them.
    pub async fn analyze_all(&self, item_category: &str, image_refs: &[String]) -> BatchResult {
        let start = Instant::now();
        let mut result = BatchResult::default();
        let total = image_refs.len();
        let mut processed = 0usize;

        let batches: Vec<&[String]> = image_refs.chunks(self.config.batch_size.max(1)).collect();

        for (batch_index, batch) in batches.iter().enumerate() {
            if start.elapsed() >= self.config.deadline {
                warn!(
                    elapsed_secs = start.elapsed().as_secs(),
                    remaining = total - processed,
                    "deadline exceeded, skipping remaining images"
                );
                result.timed_out = true;
                break;
            }

            let outcomes = futures::future::join_all(
                batch.iter().map(|image_ref| self.analyze_one(item_category, image_ref)),
            )
            .await;

            for outcome in outcomes {
                processed += 1;
                match outcome {
                    Ok(verdict) => result.verdicts.push(verdict),
                    Err(()) => result.failed_count += 1,
                }
            }

            if batch_index + 1 < batches.len() {
                tokio::time::sleep(self.config.pace).await;
            }
        }

        result.skipped_count = total - processed;
        if result.skipped_count > 0 {
            result.timed_out = true;
        }
        result
    }

    /// Analyze a single image, returning `Err(())` for any failure that
    /// should count against `failed_count` (bad reference, object-store
    /// error, or a hard upstream error). A JSON-parse failure on an
    /// otherwise-successful upstream call is not an error here: per the
    /// analyzer's contract it already degraded to a fallback verdict.
    async fn analyze_one(&self, item_category: &str, image_ref: &str) -> Result<ImageVerdict, ()> {
        let bytes = match fetch_and_recompress(
            self.store,
            image_ref,
            self.config.max_long_edge,
            self.config.jpeg_quality,
        )
        .await
        {
            Ok(bytes) => bytes,
            Err(FetchError::Ref(e)) => {
                warn!(image_ref, error = %e, "bad image reference");
                return Err(());
            }
            Err(e) => {
                warn!(image_ref, error = %e, "failed to fetch image");
                return Err(());
            }
        };

        let request = AnalyzeRequest {
            image_ref: image_ref.to_string(),
            image_bytes: bytes,
            item_category: item_category.to_string(),
        };

        match self.backend.analyze(request).await {
            Ok(verdict) => Ok(verdict),
            Err(AnalyzerError::RateLimited) => {
                warn!(image_ref, "upstream rate limited");
                Err(())
            }
            Err(e) => {
                warn!(image_ref, error = %e, "analyzer call failed");
                Err(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketplace_protocol::types::Condition;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeStore;

    #[async_trait::async_trait]
    impl ObjectStore for FakeStore {
        async fn get_object(&self, _bucket: &str, _key: &str) -> anyhow::Result<Vec<u8>> {
            use image::{ImageBuffer, Rgb};
            let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(64, 64, Rgb([1, 2, 3]));
            let mut out = std::io::Cursor::new(Vec::new());
            image::DynamicImage::ImageRgb8(img)
                .write_with_encoder(image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90))
                .unwrap();
            Ok(out.into_inner())
        }
    }

    struct FixedBackend {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl AnalyzerBackend for FixedBackend {
        async fn analyze(&self, request: AnalyzeRequest) -> Result<ImageVerdict, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ImageVerdict {
                image_ref: request.image_ref,
                defects: vec![],
                condition: Condition::A,
                price_adjustment: -5,
                confidence: 0.9,
            })
        }
    }

    struct AlwaysFailsBackend;

    #[async_trait::async_trait]
    impl AnalyzerBackend for AlwaysFailsBackend {
        async fn analyze(&self, _request: AnalyzeRequest) -> Result<ImageVerdict, AnalyzerError> {
            Err(AnalyzerError::RateLimited)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn analyzes_every_image_across_multiple_batches() {
        let store = FakeStore;
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = FixedBackend { calls: calls.clone() };
        let refs: Vec<String> = (0..12).map(|i| format!("s3://b/img{i}.jpg")).collect();
        let config = BatchConfig {
            batch_size: 5,
            pace: Duration::from_millis(1),
            ..BatchConfig::default()
        };
        let analyzer = BatchAnalyzer::new(&store, &backend, config);

        let result = analyzer.analyze_all("신발", &refs).await;
        assert_eq!(result.verdicts.len(), 12);
        assert_eq!(result.failed_count, 0);
        assert_eq!(result.skipped_count, 0);
        assert!(!result.timed_out);
        assert_eq!(calls.load(Ordering::SeqCst), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_failure_counts_as_failed_not_a_verdict() {
        let store = FakeStore;
        let backend = AlwaysFailsBackend;
        let refs = vec!["s3://b/img0.jpg".to_string(), "s3://b/img1.jpg".to_string()];
        let analyzer = BatchAnalyzer::new(&store, &backend, BatchConfig::default());

        let result = analyzer.analyze_all("가방", &refs).await;
        assert!(result.verdicts.is_empty());
        assert_eq!(result.failed_count, 2);
        assert_eq!(result.skipped_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_skips_remaining_batches() {
        let store = FakeStore;
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = FixedBackend { calls: calls.clone() };
        let refs: Vec<String> = (0..20).map(|i| format!("s3://b/img{i}.jpg")).collect();
        let config = BatchConfig {
            batch_size: 5,
            pace: Duration::from_secs(10),
            deadline: Duration::from_secs(25),
            ..BatchConfig::default()
        };
        let analyzer = BatchAnalyzer::new(&store, &backend, config);

        let result = analyzer.analyze_all("의류", &refs).await;
        assert!(result.verdicts.len() < 20);
        assert!(result.skipped_count > 0);
        assert!(result.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_sleeps_between_batches_not_after_the_last() {
        let store = FakeStore;
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = FixedBackend { calls: calls.clone() };
        let refs: Vec<String> = (0..10).map(|i| format!("s3://b/img{i}.jpg")).collect();
        let config = BatchConfig {
            batch_size: 5,
            pace: Duration::from_secs(4),
            ..BatchConfig::default()
        };
        let analyzer = BatchAnalyzer::new(&store, &backend, config);

        let start = tokio::time::Instant::now();
        let result = analyzer.analyze_all("시계", &refs).await;
        // 2 batches -> exactly one inter-batch pace, no trailing sleep.
        assert!(tokio::time::Instant::now() - start >= Duration::from_secs(4));
        assert_eq!(result.verdicts.len(), 10);
    }
}
