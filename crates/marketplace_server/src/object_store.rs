//! Local-filesystem stand-in for the production object store (S3 in the
//! original). Treats `bucket` as a subdirectory under a configured root, so
//! the rest of the pipeline's `s3://bucket/key` references work unchanged
//! in development and tests.

use std::path::PathBuf;

use async_trait::async_trait;
use marketplace_pipeline::ObjectStore;

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(bucket).join(key);
        tokio::fs::read(&path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to read object {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_object_from_bucket_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        let bucket_dir = dir.path().join("my-bucket/products");
        tokio::fs::create_dir_all(&bucket_dir).await.unwrap();
        tokio::fs::write(bucket_dir.join("img1.jpg"), b"fake-jpeg-bytes")
            .await
            .unwrap();

        let store = LocalObjectStore::new(dir.path());
        let bytes = store.get_object("my-bucket", "products/img1.jpg").await.unwrap();
        assert_eq!(bytes, b"fake-jpeg-bytes");
    }

    #[tokio::test]
    async fn missing_object_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(store.get_object("bucket", "missing.jpg").await.is_err());
    }
}
