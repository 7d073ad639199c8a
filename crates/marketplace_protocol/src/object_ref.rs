//! Object-store reference parsing: `s3://bucket/key` or bare `bucket/key`.

use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    /// NFC-normalized key, so filenames round-trip the same across platforms.
    pub key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ObjectRefError {
    #[error("object reference is empty")]
    Empty,
    #[error("object reference {0:?} has no key component")]
    MissingKey(String),
}

impl ObjectRef {
    pub fn parse(raw: &str) -> Result<Self, ObjectRefError> {
        if raw.trim().is_empty() {
            return Err(ObjectRefError::Empty);
        }
        let without_scheme = raw.strip_prefix("s3://").unwrap_or(raw);
        let mut parts = without_scheme.splitn(2, '/');
        let bucket = parts.next().unwrap_or_default();
        let key = parts
            .next()
            .ok_or_else(|| ObjectRefError::MissingKey(raw.to_string()))?;
        if bucket.is_empty() || key.is_empty() {
            return Err(ObjectRefError::MissingKey(raw.to_string()));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.nfc().collect::<String>(),
        })
    }

    /// File extension of the key, defaulting to `.jpg` when absent, matching
    /// the behavior used to name locally-staged recon images.
    pub fn extension(&self) -> &str {
        self.key
            .rsplit('.')
            .next()
            .filter(|ext| *ext != self.key)
            .unwrap_or("jpg")
    }
}
