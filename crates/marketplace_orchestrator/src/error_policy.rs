//! Classifies a pipeline failure into one of the nine [`ErrorKind`]s, once,
//! at the point it's caught - so retry/alerting decisions downstream never
//! have to re-inspect a raw error message.

use marketplace_protocol::types::ErrorKind;
use marketplace_pipeline::analyzer::AnalyzerError;
use marketplace_pipeline::fetch::FetchError;
use marketplace_pipeline::recon::ReconError;

/// Classify an analyzer-stage failure.
pub fn classify_analyzer_error(error: &AnalyzerError) -> ErrorKind {
    match error {
        AnalyzerError::RateLimited => ErrorKind::UpstreamRateLimited,
        AnalyzerError::Request(e) if e.is_timeout() => ErrorKind::Timeout,
        AnalyzerError::Request(_) | AnalyzerError::UpstreamStatus { .. } => ErrorKind::UpstreamTransient,
        AnalyzerError::Parse(_) => ErrorKind::UpstreamTransient,
    }
}

/// Classify an image-fetch failure.
pub fn classify_fetch_error(error: &FetchError) -> ErrorKind {
    match error {
        FetchError::Ref(_) => ErrorKind::InputInvalid,
        FetchError::Store { .. } => ErrorKind::FetchFailed,
        FetchError::Decode(_) => ErrorKind::InputInvalid,
    }
}

/// Classify a recon-stage failure.
pub fn classify_recon_error(error: &ReconError) -> ErrorKind {
    match error {
        ReconError::Cancelled => ErrorKind::Shutdown,
        ReconError::Timeout { .. } => ErrorKind::Timeout,
        ReconError::StageFailed { .. } => ErrorKind::PipelineStageFailed,
        ReconError::InsufficientReconstruction(_) => ErrorKind::InsufficientReconstruction,
        ReconError::Io(_) => ErrorKind::Internal,
    }
}

/// Human-readable message to store alongside the classified kind, truncated
/// so a runaway stderr tail doesn't blow out the `jobs.error_message` column.
pub fn error_message(error: &impl std::fmt::Display) -> String {
    const MAX_LEN: usize = 2000;
    let full = error.to_string();
    if full.len() > MAX_LEN {
        let cut = full
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_LEN)
            .last()
            .unwrap_or(0);
        format!("{}... (truncated)", &full[..cut])
    } else {
        full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyzer_rate_limit_maps_to_upstream_rate_limited() {
        assert_eq!(
            classify_analyzer_error(&AnalyzerError::RateLimited),
            ErrorKind::UpstreamRateLimited
        );
    }

    #[test]
    fn fetch_bad_ref_maps_to_input_invalid() {
        let err = marketplace_pipeline::fetch::FetchError::Ref(
            marketplace_protocol::object_ref::ObjectRefError::Empty,
        );
        assert_eq!(classify_fetch_error(&err), ErrorKind::InputInvalid);
    }

    #[test]
    fn recon_cancelled_maps_to_shutdown() {
        assert_eq!(classify_recon_error(&ReconError::Cancelled), ErrorKind::Shutdown);
    }

    #[test]
    fn recon_insufficient_reconstruction_maps_through() {
        let err = ReconError::InsufficientReconstruction("too few points".to_string());
        assert_eq!(classify_recon_error(&err), ErrorKind::InsufficientReconstruction);
    }

    #[test]
    fn error_message_truncates_long_text() {
        let long = "x".repeat(3000);
        let msg = error_message(&long);
        assert!(msg.len() < 2100);
        assert!(msg.ends_with("(truncated)"));
    }

    #[test]
    fn error_message_truncation_does_not_split_a_multibyte_char() {
        // Every character is 3 bytes in UTF-8, so a naive byte-index cut at
        // exactly 2000 would land mid-character.
        let long = "검".repeat(1000);
        let msg = error_message(&long);
        assert!(msg.ends_with("(truncated)"));
    }
}
