//! Executors for the two back-office pipelines: defect analysis (fetch,
//! analyze, aggregate) and 3D reconstruction (COLMAP + Gaussian splatting,
//! staged and cancellable).

pub mod aggregate;
pub mod analysis;
pub mod analyzer;
pub mod batch;
pub mod cancel;
pub mod category;
pub mod describe;
pub mod fetch;
pub mod recon;

pub use aggregate::aggregate;
pub use analysis::{analyze_product, AnalysisOutcome};
pub use analyzer::{AnalyzeRequest, AnalyzerBackend, AnalyzerError, AnalyzerOutcome, HttpAnalyzer};
pub use category::infer_category;
pub use batch::{BatchAnalyzer, BatchConfig, BatchResult};
pub use cancel::CancellationToken;
pub use describe::{generate_description, DescribeBackend, DescribeError, HttpDescriber};
pub use fetch::{fetch_all_to_directory, fetch_and_recompress, FetchError, ObjectStore, StagedImage};
pub use recon::{
    downsample_ply, ColmapStats, ProcessLog, ReconError, ReconPipeline, StageObserver, StageRunner,
};
