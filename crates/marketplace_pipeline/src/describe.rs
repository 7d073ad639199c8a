//! Generates a one-paragraph, seller-style product description from a
//! single product image. Distinct from [`crate::analyzer`]: no defect
//! taxonomy, no JSON contract, just a short natural-language blurb.

use crate::fetch::{fetch_and_recompress, FetchError, ObjectStore};
use marketplace_protocol::defaults::{DEFAULT_DESCRIPTION_IMAGE_SIZE, DEFAULT_DESCRIPTION_JPEG_QUALITY};

#[derive(Debug, thiserror::Error)]
pub enum DescribeError {
    #[error("failed to fetch image: {0}")]
    Fetch(#[from] FetchError),
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
}

/// System prompt: objective, fact-based, seller-voice, 3-5 sentences.
pub const DESCRIBE_PROMPT: &str =
    "Look at this product photo and write one seller-style paragraph (3-5 sentences) \
     describing the item objectively: what it is, its visible condition, and any \
     notable features. No marketing language, no markdown.";

/// Returned when the model refuses to answer (safety block) or comes back
/// with no candidate text at all - not an error, per the analyzer's
/// description-generation contract.
pub const FALLBACK_DESCRIPTION: &str =
    "상품 이미지를 바탕으로 한 자동 설명을 생성하지 못했습니다. 상품명과 추가 이미지를 참고해 주세요.";

#[async_trait::async_trait]
pub trait DescribeBackend: Send + Sync {
    async fn describe(&self, image_bytes: Vec<u8>, product_name: &str) -> Result<String, DescribeError>;
}

/// Fetch, downscale, and describe the single image at `image_ref`.
pub async fn generate_description(
    store: &dyn ObjectStore,
    backend: &dyn DescribeBackend,
    image_ref: &str,
    product_name: &str,
) -> Result<String, DescribeError> {
    let bytes = fetch_and_recompress(
        store,
        image_ref,
        DEFAULT_DESCRIPTION_IMAGE_SIZE,
        DEFAULT_DESCRIPTION_JPEG_QUALITY,
    )
    .await?;
    backend.describe(bytes, product_name).await
}

pub struct HttpDescriber {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpDescriber {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait::async_trait]
impl DescribeBackend for HttpDescriber {
    async fn describe(&self, image_bytes: Vec<u8>, product_name: &str) -> Result<String, DescribeError> {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&image_bytes);

        let body = serde_json::json!({
            "model": self.model,
            "system": DESCRIBE_PROMPT,
            "product_name": product_name,
            "contents": [{ "image_base64": encoded, "mime_type": "image/jpeg" }],
        });

        let response = self.client.post(&self.endpoint).bearer_auth(&self.api_key).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DescribeError::UpstreamStatus { status: status.as_u16(), body: text });
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            tracing::warn!("description upstream returned no candidate text, using fallback description");
        }
        Ok(resolve_description(&text))
    }
}

/// Trim a raw description response, substituting the canned fallback when
/// the model produced no usable text (safety block or empty candidate).
fn resolve_description(raw_text: &str) -> String {
    let trimmed = raw_text.trim();
    if trimmed.is_empty() {
        FALLBACK_DESCRIPTION.to_string()
    } else {
        trimmed.to_string()
    }
}
