//! Status classification and result ordering

use crate::models::{ProjectSource, SourceStatus, WorkflowRun};

/// Classify a candidate from the facts gathered during analysis.
///
/// First match wins. `failure_count` is `None` when verification was skipped
/// or inconclusive; only a verified count of exactly zero downgrades a repo
/// with a report artifact to `NoFailures`. Rate-limit and unsupported-format
/// conditions are mapped to their statuses before this chain is consulted.
pub fn classify(
    run: Option<&WorkflowRun>,
    artifact_names: &[String],
    report_artifacts: &[String],
    failure_count: Option<u32>,
) -> SourceStatus {
    if run.is_none() {
        return SourceStatus::NoFailedRuns;
    }
    if artifact_names.is_empty() {
        return SourceStatus::NoArtifacts;
    }
    if report_artifacts.is_empty() {
        return SourceStatus::HasArtifacts;
    }
    if failure_count == Some(0) {
        return SourceStatus::NoFailures;
    }
    SourceStatus::Compatible
}

/// Whether a classification should quarantine the repo until its TTL lapses.
///
/// Rate-limit results say nothing about the repo, and unsupported formats are
/// worth re-checking once extraction learns the format.
pub fn should_quarantine(status: SourceStatus) -> bool {
    matches!(
        status,
        SourceStatus::NoArtifacts
            | SourceStatus::NoFailedRuns
            | SourceStatus::HasArtifacts
            | SourceStatus::NoFailures
    )
}

/// Final ordering: compatible repos first, then stars descending, with the
/// repo name as a tiebreaker so concurrent analysis order never shows through.
pub fn sort_sources(sources: &mut [ProjectSource]) {
    sources.sort_by(|a, b| {
        let a_compatible = a.status == SourceStatus::Compatible;
        let b_compatible = b.status == SourceStatus::Compatible;
        b_compatible
            .cmp(&a_compatible)
            .then(b.stars.cmp(&a.stars))
            .then_with(|| a.repo.cmp(&b.repo))
    });
}
