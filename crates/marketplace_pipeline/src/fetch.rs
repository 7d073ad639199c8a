//! Fetching and re-encoding source images.
//!
//! Both pipelines start the same way: pull images from an object store, then
//! resize/recompress them before handing them to the downstream tool (COLMAP
//! or the vision analyzer). The size/quality targets differ per consumer, so
//! the caller picks them; this module only knows how to do the conversion.

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::path::{Path, PathBuf};

use marketplace_protocol::object_ref::{ObjectRef, ObjectRefError};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid object reference: {0}")]
    Ref(#[from] ObjectRefError),
    #[error("object store error fetching {bucket}/{key}: {source}")]
    Store {
        bucket: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Abstraction over the object store images are staged in (S3 in production).
/// A trait so tests can swap in in-memory fixtures without touching the
/// network.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> anyhow::Result<Vec<u8>>;
}

/// Fetch and re-encode the object at `raw_ref` to a JPEG capped at
/// `max_long_edge` pixels on its longer side, at the given `quality`.
/// Resize is skipped when the source is already within bounds.
pub async fn fetch_and_recompress(
    store: &dyn ObjectStore,
    raw_ref: &str,
    max_long_edge: u32,
    quality: u8,
) -> Result<Vec<u8>, FetchError> {
    let object_ref = ObjectRef::parse(raw_ref)?;
    let bytes = store
        .get_object(&object_ref.bucket, &object_ref.key)
        .await
        .map_err(|source| FetchError::Store {
            bucket: object_ref.bucket.clone(),
            key: object_ref.key.clone(),
            source,
        })?;

    match recompress(&bytes, max_long_edge, quality) {
        Ok(recompressed) => Ok(recompressed),
        Err(e) => {
            warn!(raw_ref, error = %e, "decode/resize failed, falling back to raw bytes");
            Ok(bytes)
        }
    }
}

/// Result of staging one image for the reconstruction pipeline's working
/// directory: the stable filename it was written under, in input order.
#[derive(Debug, Clone)]
pub struct StagedImage {
    pub image_ref: String,
    pub path: PathBuf,
}

/// Fetch every image in `image_refs` into `dest_dir`, writing each under a
/// stable `image_NNNN.ext` name that preserves input order regardless of
/// fetch completion order. Images are fetched with bounded concurrency
/// (`max_concurrent`) since COLMAP wants the raw bytes staged on disk, not
/// resized - unlike the analyzer path, no recompression happens here.
///
/// Returns the images that succeeded (in input order) plus the first error
/// encountered, if any. The job is fatal only when nothing at all could be
/// staged; a partial fetch is left to the caller (reconstruction can often
/// still proceed with fewer views).
pub async fn fetch_all_to_directory(
    store: &dyn ObjectStore,
    image_refs: &[String],
    dest_dir: &Path,
    max_concurrent: usize,
) -> (Vec<StagedImage>, Option<FetchError>) {
    let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(max_concurrent.max(1)));

    let tasks = image_refs.iter().enumerate().map(|(index, raw_ref)| {
        let semaphore = semaphore.clone();
        let raw_ref = raw_ref.clone();
        let dest_dir = dest_dir.to_path_buf();
        async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            stage_one(store, &raw_ref, index, &dest_dir).await
        }
    });

    let outcomes = futures::future::join_all(tasks).await;

    let mut staged = Vec::with_capacity(outcomes.len());
    let mut first_error = None;
    for outcome in outcomes {
        match outcome {
            Ok(image) => staged.push(image),
            Err(e) => {
                warn!(error = %e, "failed to stage image for reconstruction");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    staged.sort_by(|a, b| a.path.cmp(&b.path));
    (staged, first_error)
}

async fn stage_one(
    store: &dyn ObjectStore,
    raw_ref: &str,
    index: usize,
    dest_dir: &Path,
) -> Result<StagedImage, FetchError> {
    let object_ref = ObjectRef::parse(raw_ref)?;
    let bytes = store
        .get_object(&object_ref.bucket, &object_ref.key)
        .await
        .map_err(|source| FetchError::Store {
            bucket: object_ref.bucket.clone(),
            key: object_ref.key.clone(),
            source,
        })?;

    let ext = Path::new(&object_ref.key)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("jpg");
    let path = dest_dir.join(format!("image_{index:04}.{ext}"));
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|source| FetchError::Store {
            bucket: object_ref.bucket,
            key: object_ref.key,
            source: source.into(),
        })?;

    Ok(StagedImage {
        image_ref: raw_ref.to_string(),
        path,
    })
}

fn recompress(bytes: &[u8], max_long_edge: u32, quality: u8) -> Result<Vec<u8>, FetchError> {
    let img = image::load_from_memory(bytes)?;
    let resized = resize_to_long_edge(img, max_long_edge);
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());

    let mut out = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    rgb.write_with_encoder(encoder)?;
    Ok(out.into_inner())
}

fn resize_to_long_edge(img: DynamicImage, max_long_edge: u32) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    if w.max(h) <= max_long_edge {
        return img;
    }
    let ratio = max_long_edge as f64 / w.max(h) as f64;
    let new_w = (w as f64 * ratio).round().max(1.0) as u32;
    let new_h = (h as f64 * ratio).round().max(1.0) as u32;
    img.resize(new_w, new_h, FilterType::Lanczos3)
}

/// Detect the image format from the first bytes, used when a fetched object's
/// extension can't be trusted.
pub fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn solid_jpeg(w: u32, h: u32) -> Vec<u8> {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(w, h, Rgb([128, 64, 200]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_with_encoder(image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90))
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn recompress_shrinks_oversized_images() {
        let original = solid_jpeg(2000, 1000);
        let out = recompress(&original, 1000, 85).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.width(), 1000);
        assert_eq!(decoded.height(), 500);
    }

    #[test]
    fn recompress_leaves_small_images_unscaled() {
        let original = solid_jpeg(400, 300);
        let out = recompress(&original, 1200, 85).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.width(), 400);
        assert_eq!(decoded.height(), 300);
    }

    struct FakeStore {
        body: Vec<u8>,
    }

    #[async_trait::async_trait]
    impl ObjectStore for FakeStore {
        async fn get_object(&self, _bucket: &str, _key: &str) -> anyhow::Result<Vec<u8>> {
            Ok(self.body.clone())
        }
    }

    #[tokio::test]
    async fn fetch_and_recompress_roundtrips_through_object_ref() {
        let store = FakeStore {
            body: solid_jpeg(1800, 1800),
        };
        let out = fetch_and_recompress(&store, "s3://bucket/products/img1.jpg", 1600, 90)
            .await
            .unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.width(), 1600);
    }

    #[tokio::test]
    async fn fetch_and_recompress_rejects_bad_ref() {
        let store = FakeStore { body: vec![] };
        let err = fetch_and_recompress(&store, "", 1600, 90).await.unwrap_err();
        assert!(matches!(err, FetchError::Ref(_)));
    }

    #[tokio::test]
    async fn fetch_and_recompress_falls_back_to_raw_bytes_on_decode_failure() {
        let store = FakeStore {
            body: b"not an image".to_vec(),
        };
        let out = fetch_and_recompress(&store, "s3://bucket/products/img1.jpg", 1600, 90)
            .await
            .unwrap();
        assert_eq!(out, b"not an image");
    }

    #[tokio::test]
    async fn fetch_all_to_directory_preserves_input_order() {
        let store = FakeStore {
            body: solid_jpeg(100, 100),
        };
        let dir = tempfile::tempdir().unwrap();
        let refs: Vec<String> = (0..4)
            .map(|i| format!("s3://bucket/products/img{i}.jpg"))
            .collect();

        let (staged, first_error) = fetch_all_to_directory(&store, &refs, dir.path(), 2).await;
        assert!(first_error.is_none());
        assert_eq!(staged.len(), 4);
        for (i, image) in staged.iter().enumerate() {
            assert_eq!(image.path.file_name().unwrap(), format!("image_{i:04}.jpg").as_str());
        }
    }

    struct PartiallyFailingStore;

    #[async_trait::async_trait]
    impl ObjectStore for PartiallyFailingStore {
        async fn get_object(&self, _bucket: &str, key: &str) -> anyhow::Result<Vec<u8>> {
            if key.contains("bad") {
                anyhow::bail!("object not found")
            } else {
                Ok(solid_jpeg(50, 50))
            }
        }
    }

    #[tokio::test]
    async fn fetch_all_to_directory_reports_first_error_but_keeps_successes() {
        let store = PartiallyFailingStore;
        let dir = tempfile::tempdir().unwrap();
        let refs = vec![
            "s3://bucket/products/ok1.jpg".to_string(),
            "s3://bucket/products/bad.jpg".to_string(),
            "s3://bucket/products/ok2.jpg".to_string(),
        ];

        let (staged, first_error) = fetch_all_to_directory(&store, &refs, dir.path(), 4).await;
        assert_eq!(staged.len(), 2);
        assert!(first_error.is_some());
    }
}
