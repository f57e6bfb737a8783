//! Artifact selection for a failed run
//!
//! A run often uploads several artifacts (per-browser reports, shard blobs,
//! coverage, logs). When we know which jobs failed, prefer the artifact whose
//! name correlates with a failed job, so we download the report that actually
//! contains the failures.

use crate::models::{is_report_artifact, ArtifactInfo};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Minimum correlation score before a pick is trusted.
const SCORE_THRESHOLD: u32 = 5;

fn matrix_suffix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s*\[\d+/\d+\]").unwrap())
}

fn paren_suffix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s*\([^)]+\)").unwrap())
}

fn shard_fraction_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[(\d+)/\d+\]").unwrap())
}

fn trailing_index_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[-_](\d+)$").unwrap())
}

/// Lowercase with separator characters removed, so `blob-report` and
/// `Blob_Report` compare equal.
fn normalize(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .collect()
}

/// A job name with its matrix suffix (`[2/4]`) and parenthesized qualifiers
/// (`(chromium)`) removed, normalized for containment checks.
fn job_core(name: &str) -> String {
    let stripped = matrix_suffix_pattern().replace_all(name, "");
    let stripped = paren_suffix_pattern().replace_all(&stripped, "");
    normalize(stripped.trim())
}

/// Shard index from either a `[2/4]` fraction or a trailing `-2`/`_2`.
fn shard_index(name: &str) -> Option<u32> {
    if let Some(captures) = shard_fraction_pattern().captures(name) {
        return captures.get(1)?.as_str().parse().ok();
    }
    trailing_index_pattern()
        .captures(name)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Pick the artifact most likely to contain the failures of the given jobs.
///
/// Scores each artifact on job-name containment (plus a shard-index bonus
/// against the matched job) and report-flavored keywords. Returns `None` when
/// nothing scores above the threshold; ties keep the first-scored artifact.
/// Callers fall back to the first report-like artifact when this returns
/// `None`.
pub fn select_best_artifact<'a>(
    artifacts: &'a [ArtifactInfo],
    failed_jobs: &[String],
) -> Option<&'a ArtifactInfo> {
    let mut job_cores: Vec<String> = Vec::new();
    let mut shard_by_core: HashMap<String, Option<u32>> = HashMap::new();
    for name in failed_jobs {
        let core = job_core(name);
        if core.is_empty() {
            continue;
        }
        shard_by_core.insert(core.clone(), shard_index(name));
        job_cores.push(core);
    }

    let mut best: Option<&ArtifactInfo> = None;
    let mut best_score = 0u32;

    for artifact in artifacts {
        let normalized = normalize(&artifact.name);
        let mut score = 0u32;

        if let Some(core) = job_cores.iter().find(|core| normalized.contains(core.as_str())) {
            score += 50;
            if let Some(job_shard) = shard_by_core.get(core).and_then(|shard| *shard) {
                if shard_index(&artifact.name) == Some(job_shard) {
                    score += 20;
                }
            }
        }
        if is_report_artifact(&artifact.name) {
            score += 30;
        }
        if normalized.contains("playwright") {
            score += 15;
        }
        if normalized.contains("blob") {
            score += 10;
        }
        if normalized.contains("report") {
            score += 5;
        }
        if normalized.contains("e2e") {
            score += 5;
        }

        if score > best_score {
            best = Some(artifact);
            best_score = score;
        }
    }

    if best_score > SCORE_THRESHOLD {
        best
    } else {
        None
    }
}
