//! Core domain types for discovery
//!
//! Statuses, candidate records, and the artifact-name heuristics shared by the
//! client, the analyzer, and the orchestrator.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

// ============================================================================
// Search Queries
// ============================================================================

/// Code-search queries that find workflows uploading Playwright artifacts.
/// Ordered from most to least specific; results are deduplicated across them.
pub const DEFAULT_QUERIES: &[&str] = &[
    "playwright \"upload-artifact\" path:.github/workflows extension:yml",
    "\"blob-report\" \"upload-artifact\" path:.github/workflows",
    "\"playwright-report\" \"actions/upload-artifact\" path:.github/workflows",
    "\"blob-report\" path:.github extension:yml",
];

/// How many recent failed runs to inspect per repository before giving up on
/// finding one with usable artifacts.
pub const MAX_RUNS_TO_CHECK: usize = 5;

// ============================================================================
// Artifact Name Matching
// ============================================================================

/// Artifact names that look like Playwright report uploads.
///
/// Anchored patterns catch conventional names (`playwright-report`,
/// `blob-report-3`, `trace.zip`); the unanchored ones catch prefixed
/// variants like `chromium-playwright-report`.
fn report_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)^playwright[-_]?report|^blob[-_]?report|^playwright[-_]?traces?|^trace\.zip$|playwright.*report|playwright.*traces?",
        )
        .unwrap()
    })
}

/// Whether an artifact name looks like a Playwright test report.
pub fn is_report_artifact(name: &str) -> bool {
    report_name_pattern().is_match(name)
}

// ============================================================================
// Statuses
// ============================================================================

/// Terminal classification of a candidate repository.
///
/// Assigned exactly once per discovery pass; never mutated afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// No failed workflow runs found at all.
    NoFailedRuns,
    /// Failed runs exist but none kept any artifacts.
    NoArtifacts,
    /// Artifacts exist but none look like a test report.
    HasArtifacts,
    /// A report artifact exists but contains zero failures.
    NoFailures,
    /// A report artifact with at least one failure (or verification skipped).
    Compatible,
    /// The report uses a bundled format we cannot parse.
    UnsupportedFormat,
    /// Analysis aborted because the API rate limit was exhausted.
    RateLimited,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::NoFailedRuns => "no_failed_runs",
            SourceStatus::NoArtifacts => "no_artifacts",
            SourceStatus::HasArtifacts => "has_artifacts",
            SourceStatus::NoFailures => "no_failures",
            SourceStatus::Compatible => "compatible",
            SourceStatus::UnsupportedFormat => "unsupported_format",
            SourceStatus::RateLimited => "rate_limited",
        }
    }
}

// ============================================================================
// Candidate Records
// ============================================================================

/// A repository that matched a search query, before analysis.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// `owner/repo` identifier.
    pub repo: String,
    /// Star count, if already fetched during collection.
    pub stars: Option<u32>,
}

/// A fully analyzed repository, ready for display or export.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectSource {
    /// `owner/repo` identifier.
    pub repo: String,
    pub stars: u32,
    pub status: SourceStatus,
    /// Every artifact name on the selected run.
    pub artifact_names: Vec<String>,
    /// The subset of artifact names that look like test reports.
    pub report_artifacts: Vec<String>,
    /// The failed run the artifacts came from.
    pub run_id: Option<u64>,
    pub run_url: Option<String>,
}

impl ProjectSource {
    /// A candidate that produced no analyzable run data.
    pub fn bare(repo: String, stars: u32, status: SourceStatus) -> Self {
        ProjectSource {
            repo,
            stars,
            status,
            artifact_names: Vec::new(),
            report_artifacts: Vec::new(),
            run_id: None,
            run_url: None,
        }
    }
}

// ============================================================================
// Workflow Data
// ============================================================================

/// A failed workflow run as reported by the runs listing.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub html_url: String,
}

/// One artifact attached to a workflow run.
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactInfo {
    pub id: u64,
    pub name: String,
    pub size_in_bytes: u64,
    #[serde(default)]
    pub expired: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_names_match() {
        assert!(is_report_artifact("playwright-report"));
        assert!(is_report_artifact("Playwright_Report"));
        assert!(is_report_artifact("blob-report-3"));
        assert!(is_report_artifact("playwright-traces"));
        assert!(is_report_artifact("trace.zip"));
        assert!(is_report_artifact("chromium-playwright-report"));
    }

    #[test]
    fn test_non_report_names_rejected() {
        assert!(!is_report_artifact("coverage"));
        assert!(!is_report_artifact("build-logs"));
        assert!(!is_report_artifact("trace.zip.sha256"));
        assert!(!is_report_artifact("screenshots"));
    }

    #[test]
    fn test_status_labels_are_snake_case() {
        let json = serde_json::to_string(&SourceStatus::NoFailedRuns).unwrap();
        assert_eq!(json, "\"no_failed_runs\"");
        let parsed: SourceStatus = serde_json::from_str("\"unsupported_format\"").unwrap();
        assert_eq!(parsed, SourceStatus::UnsupportedFormat);
        assert_eq!(SourceStatus::RateLimited.as_str(), "rate_limited");
    }

    #[test]
    fn test_artifact_expired_defaults_false() {
        let artifact: ArtifactInfo = serde_json::from_str(
            r#"{"id": 7, "name": "playwright-report", "size_in_bytes": 1024}"#,
        )
        .unwrap();
        assert!(!artifact.expired);
    }
}
