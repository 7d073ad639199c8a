//! Admission control and status reconciliation sitting between the HTTP
//! surface and the pipeline executors.

pub mod error_policy;
pub mod reconcile;
pub mod scheduler;

pub use reconcile::{StatusReconciler, TerminalSink};
pub use scheduler::{AdmissionPermit, Scheduler};
