//! Top-level entry point for the defect-analysis pipeline: wires
//! [`infer_category`], [`BatchAnalyzer`], and [`aggregate`] together under a
//! hard outer deadline that can interrupt a batch mid-flight, which
//! `BatchAnalyzer`'s own soft deadline check cannot do.

use std::time::Duration;

use marketplace_protocol::types::{ImageVerdict, ProductVerdict};

use crate::aggregate::aggregate;
use crate::analyzer::AnalyzerBackend;
use crate::batch::{BatchAnalyzer, BatchConfig, BatchResult};
use crate::category::infer_category;
use crate::fetch::ObjectStore;

/// Per-image verdicts plus the aggregate they produced, so a caller that
/// needs to report per-image findings (the HTTP surface's
/// `inspection_results`) doesn't have to re-derive them from the markdown.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub verdicts: Vec<ImageVerdict>,
    pub aggregate: ProductVerdict,
}

/// Run the full analysis pipeline for one product: infer a category hint,
/// fan its images out through the analyzer, and aggregate the results into
/// a [`ProductVerdict`]. If `outer_deadline` elapses before the batch run
/// finishes, the run is abandoned and whatever verdicts were gathered are
/// lost - the outer timeout is a hard cutoff, unlike `BatchConfig::deadline`
/// which only stops new batches from starting.
pub async fn analyze_product(
    store: &dyn ObjectStore,
    backend: &dyn AnalyzerBackend,
    product_id: &str,
    product_name: Option<&str>,
    image_refs: &[String],
    batch_config: BatchConfig,
    outer_deadline: Duration,
) -> AnalysisOutcome {
    let category = infer_category(product_name);
    let total_requested = image_refs.len();

    let analyzer = BatchAnalyzer::new(store, backend, batch_config);
    let run = analyzer.analyze_all(&category, image_refs);

    let (verdicts, failed_count, timed_out) = match tokio::time::timeout(outer_deadline, run).await
    {
        Ok(BatchResult {
            verdicts,
            failed_count,
            timed_out,
            ..
        }) => (verdicts, failed_count, timed_out),
        Err(_elapsed) => {
            tracing::warn!(product_id, "outer deadline elapsed mid-batch, aborting analysis");
            (Vec::new(), 0, true)
        }
    };

    let aggregate = aggregate(
        product_id,
        product_name,
        &verdicts,
        total_requested,
        failed_count,
        timed_out,
    );

    AnalysisOutcome { verdicts, aggregate }
}
