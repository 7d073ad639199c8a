//! Wire types and job taxonomy shared by the orchestrator, the pipeline
//! executors, and the HTTP surface.
//!
//! Kept free of any I/O so it can be depended on by every other crate in
//! the workspace without pulling in tokio, sqlx, or axum.

pub mod defaults;
pub mod http_types;
pub mod object_ref;
pub mod types;

pub use object_ref::{ObjectRef, ObjectRefError};
pub use types::{
    Condition, Defect, ErrorKind, ImageVerdict, Job, JobKind, JobStatus, ProductVerdict,
    ProtocolError, ReconStage, Severity,
};
