//! Core domain types shared by the orchestrator, the pipeline executors, and the HTTP surface.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which of the two back-office pipelines a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Analysis,
    Recon,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobKind::Analysis => "analysis",
            JobKind::Recon => "recon",
        })
    }
}

impl FromStr for JobKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(JobKind::Analysis),
            "recon" => Ok(JobKind::Recon),
            other => Err(ProtocolError::UnknownVariant {
                ty: "JobKind",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle status of a Job. Transitions are monotone:
/// `queued -> running -> {done, failed}` or `queued -> failed` (shutdown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        })
    }
}

impl FromStr for JobStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ProtocolError::UnknownVariant {
                ty: "JobStatus",
                value: other.to_string(),
            }),
        }
    }
}

/// Named checkpoints of the recon pipeline, in execution order.
/// `progress()` gives each checkpoint's percentage through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconStage {
    ColmapFeatures,
    ColmapMatch,
    ColmapMap,
    ColmapUndistort,
    ColmapValidate,
    GsTrain,
    ExportPly,
    Done,
    Error,
}

impl ReconStage {
    pub const ORDERED: [ReconStage; 7] = [
        ReconStage::ColmapFeatures,
        ReconStage::ColmapMatch,
        ReconStage::ColmapMap,
        ReconStage::ColmapUndistort,
        ReconStage::ColmapValidate,
        ReconStage::GsTrain,
        ReconStage::ExportPly,
    ];

    pub fn progress(self) -> u8 {
        match self {
            ReconStage::ColmapFeatures => 15,
            ReconStage::ColmapMatch => 30,
            ReconStage::ColmapMap => 45,
            ReconStage::ColmapUndistort => 55,
            ReconStage::ColmapValidate => 60,
            ReconStage::GsTrain => 65,
            ReconStage::ExportPly => 95,
            ReconStage::Done => 100,
            ReconStage::Error => 0,
        }
    }

    /// True if `next` may legally follow `self` (forward progress, or a jump to `error`).
    pub fn can_advance_to(self, next: ReconStage) -> bool {
        if next == ReconStage::Error {
            return true;
        }
        let ordinal = |s: ReconStage| Self::ORDERED.iter().position(|&x| x == s);
        match (ordinal(self), ordinal(next)) {
            (Some(a), Some(b)) => b > a,
            _ => next == ReconStage::Done && self == ReconStage::ExportPly,
        }
    }
}

impl fmt::Display for ReconStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReconStage::ColmapFeatures => "colmap_features",
            ReconStage::ColmapMatch => "colmap_match",
            ReconStage::ColmapMap => "colmap_map",
            ReconStage::ColmapUndistort => "colmap_undistort",
            ReconStage::ColmapValidate => "colmap_validate",
            ReconStage::GsTrain => "gs_train",
            ReconStage::ExportPly => "export_ply",
            ReconStage::Done => "done",
            ReconStage::Error => "error",
        })
    }
}

impl FromStr for ReconStage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "colmap_features" => ReconStage::ColmapFeatures,
            "colmap_match" => ReconStage::ColmapMatch,
            "colmap_map" => ReconStage::ColmapMap,
            "colmap_undistort" => ReconStage::ColmapUndistort,
            "colmap_validate" => ReconStage::ColmapValidate,
            "gs_train" => ReconStage::GsTrain,
            "export_ply" => ReconStage::ExportPly,
            "done" => ReconStage::Done,
            "error" => ReconStage::Error,
            other => {
                return Err(ProtocolError::UnknownVariant {
                    ty: "ReconStage",
                    value: other.to_string(),
                })
            }
        })
    }
}

/// Condition grade, ordered best (`S`) to worst (`D`). The ordinal is used
/// directly by the Aggregator's trimmed-mean computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Condition {
    S,
    A,
    B,
    C,
    D,
}

impl Condition {
    pub const ORDER: [Condition; 5] = [
        Condition::S,
        Condition::A,
        Condition::B,
        Condition::C,
        Condition::D,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ORDER.get(ordinal as usize).copied()
    }

    /// Korean label shown in the markdown summary, matching the copy the
    /// product team ships to sellers.
    pub fn label_ko(self) -> &'static str {
        match self {
            Condition::S => "최상 (거의 새것)",
            Condition::A => "우수 (미세한 사용감)",
            Condition::B => "양호 (약간의 결함)",
            Condition::C => "보통 (눈에 띄는 결함)",
            Condition::D => "불량 (심각한 결함)",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Condition::S => "S",
            Condition::A => "A",
            Condition::B => "B",
            Condition::C => "C",
            Condition::D => "D",
        })
    }
}

impl FromStr for Condition {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "S" => Condition::S,
            "A" => Condition::A,
            "B" => Condition::B,
            "C" => Condition::C,
            "D" => Condition::D,
            other => {
                return Err(ProtocolError::UnknownVariant {
                    ty: "Condition",
                    value: other.to_string(),
                })
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        })
    }
}

/// A single flagged defect on one image. Free-form strings except severity/confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defect {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub location: String,
    pub description: String,
    pub confidence: f64,
}

/// Per-image verdict from the analyzer. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageVerdict {
    pub image_ref: String,
    pub defects: Vec<Defect>,
    pub condition: Condition,
    /// Negative or zero, percent discount recommendation, in `[-50, 0]`.
    pub price_adjustment: i32,
    pub confidence: f64,
}

/// Product-level verdict produced by the Aggregator. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductVerdict {
    pub product_id: String,
    pub condition: Condition,
    pub price_adjustment: i32,
    pub total_defects: usize,
    pub markdown: String,
    pub completed_at: DateTime<Utc>,
}

/// Pipeline failure taxonomy. Classified once, at the point of catch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InputInvalid,
    FetchFailed,
    UpstreamRateLimited,
    UpstreamTransient,
    PipelineStageFailed,
    InsufficientReconstruction,
    Timeout,
    Shutdown,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::InputInvalid => "input_invalid",
            ErrorKind::FetchFailed => "fetch_failed",
            ErrorKind::UpstreamRateLimited => "upstream_rate_limited",
            ErrorKind::UpstreamTransient => "upstream_transient",
            ErrorKind::PipelineStageFailed => "pipeline_stage_failed",
            ErrorKind::InsufficientReconstruction => "insufficient_reconstruction",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::Internal => "internal",
        })
    }
}

/// A job's mutable record, as stored by JobStore. Single-writer: only the
/// executor that owns a job may mutate its row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub product_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub stage: String,
    pub progress: u8,
    pub image_count: u32,
    pub iterations: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error_stage: Option<String>,
    pub error_message: Option<String>,
    pub log_tail: Vec<String>,
}

impl Job {
    pub fn new(product_id: impl Into<String>, kind: JobKind, image_count: u32) -> Self {
        Self {
            product_id: product_id.into(),
            kind,
            status: JobStatus::Queued,
            stage: "queued".to_string(),
            progress: 0,
            image_count,
            iterations: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_kind: None,
            error_stage: None,
            error_message: None,
            log_tail: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown {ty} variant: {value}")]
    UnknownVariant { ty: &'static str, value: String },
}
