//! The vision-model client: sends one JPEG at a time to an external
//! multimodal endpoint and parses its defect-inspection verdict.
//!
//! The upstream model is instructed to answer with JSON only, but in
//! practice wraps it in a fenced code block more often than not - we strip
//! that before parsing rather than fight the prompt.

use marketplace_protocol::types::{Condition, Defect, ImageVerdict, Severity};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("could not parse upstream response as a verdict: {0}")]
    Parse(String),
}

/// What the analyzer asks of, and expects back from, the model for one image.
#[derive(Debug, Clone)]
pub struct AnalyzeRequest {
    pub image_ref: String,
    pub image_bytes: Vec<u8>,
    pub item_category: String,
}

/// Abstraction over the external vision model so `BatchAnalyzer` and tests
/// don't depend on a live network call.
#[async_trait::async_trait]
pub trait AnalyzerBackend: Send + Sync {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<ImageVerdict, AnalyzerError>;
}

/// System prompt sent once per request, instructing the model on the
/// taxonomy and required response shape. Kept verbatim-stable across
/// requests so the upstream can cache it.
pub const SYSTEM_PROMPT: &str = r#"You are an expert condition inspector for a used-goods marketplace.
Respond with JSON only, no markdown, matching exactly:
{"defects":[{"type":"scratch|discoloration|tear|stain|mold|chip|crack|wrinkle|peeling|other","severity":"high|medium|low","location":"...","description":"...","confidence":0.0}],"overall_condition":"S|A|B|C|D","recommended_price_adjustment":-50,"analysis_confidence":0.0}
recommended_price_adjustment must be an integer in [-50, 0]."#;

#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(default)]
    defects: Vec<RawDefect>,
    overall_condition: String,
    recommended_price_adjustment: i32,
    #[serde(default = "default_confidence")]
    analysis_confidence: f64,
}

#[derive(Debug, Deserialize)]
struct RawDefect {
    #[serde(rename = "type")]
    kind: String,
    severity: String,
    location: String,
    description: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

fn parse_severity(raw: &str) -> Severity {
    match raw.to_ascii_lowercase().as_str() {
        "high" | "상" => Severity::High,
        "low" | "하" => Severity::Low,
        _ => Severity::Medium,
    }
}

/// Strip a ```json ... ``` or ``` ... ``` fence, if present, and return the
/// inner text. The model is asked not to do this but frequently does anyway.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.trim().trim_end_matches("```").trim()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim().trim_end_matches("```").trim()
    } else {
        trimmed
    }
}

/// Result of parsing one upstream response: either a verdict we could make
/// sense of, or one we defaulted because the response wasn't parseable JSON.
/// Keeping the fallback path as a distinct variant (rather than silently
/// returning the same `ImageVerdict` shape either way) means callers can
/// count how often the upstream model fails to follow its own schema.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzerOutcome {
    Parsed(ImageVerdict),
    Defaulted { image_ref: String, reason: String },
}

impl AnalyzerOutcome {
    pub fn into_verdict(self) -> ImageVerdict {
        match self {
            AnalyzerOutcome::Parsed(verdict) => verdict,
            AnalyzerOutcome::Defaulted { image_ref, .. } => fallback_verdict(&image_ref),
        }
    }

    pub fn is_defaulted(&self) -> bool {
        matches!(self, AnalyzerOutcome::Defaulted { .. })
    }
}

/// Parse a raw model response body, falling back to a conservative
/// placeholder verdict when the JSON can't be made sense of rather than
/// failing the whole batch over one malformed response.
pub fn parse_outcome(image_ref: &str, raw_text: &str) -> AnalyzerOutcome {
    let cleaned = strip_code_fence(raw_text);
    match serde_json::from_str::<RawVerdict>(cleaned) {
        Ok(raw) => {
            let condition = raw.overall_condition.parse().unwrap_or(Condition::C);
            AnalyzerOutcome::Parsed(ImageVerdict {
                image_ref: image_ref.to_string(),
                defects: raw
                    .defects
                    .into_iter()
                    .map(|d| Defect {
                        kind: d.kind,
                        severity: parse_severity(&d.severity),
                        location: d.location,
                        description: d.description,
                        confidence: d.confidence.clamp(0.0, 1.0),
                    })
                    .collect(),
                condition,
                price_adjustment: raw.recommended_price_adjustment.clamp(-50, 0),
                confidence: raw.analysis_confidence.clamp(0.0, 1.0),
            })
        }
        Err(e) => AnalyzerOutcome::Defaulted {
            image_ref: image_ref.to_string(),
            reason: e.to_string(),
        },
    }
}

/// Parse a raw model response body into an [`ImageVerdict`], collapsing the
/// fallback path into the same default verdict `parse_outcome` would produce.
/// Most callers only need the verdict; use `parse_outcome` when the
/// parsed-vs-defaulted distinction matters.
pub fn parse_verdict(image_ref: &str, raw_text: &str) -> ImageVerdict {
    parse_outcome(image_ref, raw_text).into_verdict()
}

/// The verdict used when the upstream response can't be parsed at all - a
/// mid-scale grade with a modest discount and middling confidence, so it
/// doesn't silently drag an aggregation toward "perfect" or "worthless".
pub fn fallback_verdict(image_ref: &str) -> ImageVerdict {
    ImageVerdict {
        image_ref: image_ref.to_string(),
        defects: Vec::new(),
        condition: Condition::C,
        price_adjustment: -20,
        confidence: 0.5,
    }
}

/// Reqwest-backed client for the production multimodal endpoint.
pub struct HttpAnalyzer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpAnalyzer {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds with static config"),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait::async_trait]
impl AnalyzerBackend for HttpAnalyzer {
    async fn analyze(&self, request: AnalyzeRequest) -> Result<ImageVerdict, AnalyzerError> {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&request.image_bytes);

        let body = serde_json::json!({
            "model": self.model,
            "system": SYSTEM_PROMPT,
            "temperature": 0.1,
            "safety_settings": { "block_threshold": "block_only_high" },
            "contents": [{
                "category": request.item_category,
                "image_base64": encoded,
                "mime_type": "image/jpeg",
            }],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(AnalyzerError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AnalyzerError::UpstreamStatus {
                status: status.as_u16(),
                body: text,
            });
        }

        let text = response.text().await?;
        let outcome = parse_outcome(&request.image_ref, &text);
        if let AnalyzerOutcome::Defaulted { image_ref, reason } = &outcome {
            tracing::warn!(image_ref, reason, "upstream response not parseable, using default verdict");
        }
        Ok(outcome.into_verdict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json() {
        let verdict = parse_verdict(
            "img-1",
            r#"{"defects":[{"type":"scratch","severity":"low","location":"corner","description":"small scratch","confidence":0.8}],"overall_condition":"A","recommended_price_adjustment":-5,"analysis_confidence":0.9}"#,
        );
        assert_eq!(verdict.condition, Condition::A);
        assert_eq!(verdict.price_adjustment, -5);
        assert_eq!(verdict.defects.len(), 1);
    }

    #[test]
    fn strips_json_code_fence() {
        let wrapped = "```json\n{\"defects\":[],\"overall_condition\":\"S\",\"recommended_price_adjustment\":0,\"analysis_confidence\":0.95}\n```";
        let verdict = parse_verdict("img-2", wrapped);
        assert_eq!(verdict.condition, Condition::S);
        assert!(verdict.defects.is_empty());
    }

    #[test]
    fn strips_bare_code_fence() {
        let wrapped = "```\n{\"defects\":[],\"overall_condition\":\"B\",\"recommended_price_adjustment\":-10,\"analysis_confidence\":0.7}\n```";
        let verdict = parse_verdict("img-3", wrapped);
        assert_eq!(verdict.condition, Condition::B);
    }

    #[test]
    fn clamps_out_of_range_price_adjustment() {
        let verdict = parse_verdict(
            "img-4",
            r#"{"defects":[],"overall_condition":"D","recommended_price_adjustment":-90,"analysis_confidence":0.5}"#,
        );
        assert_eq!(verdict.price_adjustment, -50);
    }

    #[test]
    fn falls_back_on_garbage_response() {
        let verdict = parse_verdict("img-5", "not json at all");
        assert_eq!(verdict.condition, Condition::C);
        assert_eq!(verdict.price_adjustment, -20);
        assert_eq!(verdict.confidence, 0.5);
    }

    #[test]
    fn falls_back_on_unknown_condition_letter() {
        let verdict = parse_verdict(
            "img-6",
            r#"{"defects":[],"overall_condition":"Z","recommended_price_adjustment":0,"analysis_confidence":0.5}"#,
        );
        assert_eq!(verdict.condition, Condition::C);
    }

    #[test]
    fn parse_outcome_distinguishes_defaulted_from_parsed() {
        let parsed = parse_outcome(
            "img-7",
            r#"{"defects":[],"overall_condition":"A","recommended_price_adjustment":-5,"analysis_confidence":0.9}"#,
        );
        assert!(!parsed.is_defaulted());

        let defaulted = parse_outcome("img-8", "garbage");
        assert!(defaulted.is_defaulted());
        assert_eq!(defaulted.into_verdict().condition, Condition::C);
    }
}
