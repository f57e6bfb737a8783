//! Discovery orchestration
//!
//! Runs the three phases of a discovery pass: collect candidates from code
//! search, analyze them concurrently (runs, artifacts, optional download and
//! verification), and update the quarantine cache from the outcomes. Progress
//! goes out as events; the return value is the sorted result list.

use crate::analyzer::{extract_failure_count, MAX_NESTED_DEPTH};
use crate::cache::{
    default_cache_dir, QuarantineCache, RunCache, QUARANTINE_CACHE_FILE, RUN_CACHE_FILE,
};
use crate::classify::{classify, should_quarantine, sort_sources};
use crate::client::GitHubApi;
use crate::error::{ApiError, UnsupportedFormat};
use crate::events::{DiscoveryEvent, EventSender};
use crate::models::{
    is_report_artifact, ArtifactInfo, Candidate, ProjectSource, SourceStatus, WorkflowRun,
    DEFAULT_QUERIES, MAX_RUNS_TO_CHECK,
};
use crate::selection::select_best_artifact;
use crate::util::format_size;
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Candidates analyzed in parallel. Independent of the in-flight call bound,
/// which the shared rate limiter enforces across all workers.
const MAX_WORKERS: usize = 4;

// ============================================================================
// Options
// ============================================================================

/// Where a cache file lives.
#[derive(Debug, Clone, Default)]
pub enum CacheLocation {
    /// The per-user cache directory.
    #[default]
    Default,
    /// No persistence; entries live for the process only.
    Disabled,
    /// A caller-chosen file path.
    Path(PathBuf),
}

#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    pub queries: Vec<String>,
    /// Stop collecting once this many candidates are accepted.
    pub limit: usize,
    /// Minimum star count; 0 disables the filter.
    pub min_stars: u32,
    /// Download and analyze report artifacts to confirm real failures.
    pub verify_failures: bool,
    /// Analyze repos even if they are quarantined.
    pub bypass_quarantine: bool,
    pub run_cache: CacheLocation,
    pub quarantine_cache: CacheLocation,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        DiscoverOptions {
            queries: DEFAULT_QUERIES.iter().map(|q| q.to_string()).collect(),
            limit: 30,
            min_stars: 0,
            verify_failures: true,
            bypass_quarantine: false,
            run_cache: CacheLocation::Default,
            quarantine_cache: CacheLocation::Default,
        }
    }
}

fn resolve_run_cache(location: &CacheLocation) -> RunCache {
    match location {
        CacheLocation::Default => match default_cache_dir() {
            Some(dir) => RunCache::load(dir.join(RUN_CACHE_FILE)),
            None => RunCache::in_memory(),
        },
        CacheLocation::Disabled => RunCache::in_memory(),
        CacheLocation::Path(path) => RunCache::load(path.clone()),
    }
}

fn resolve_quarantine_cache(location: &CacheLocation) -> QuarantineCache {
    match location {
        CacheLocation::Default => match default_cache_dir() {
            Some(dir) => QuarantineCache::load(dir.join(QUARANTINE_CACHE_FILE)),
            None => QuarantineCache::in_memory(),
        },
        CacheLocation::Disabled => QuarantineCache::in_memory(),
        CacheLocation::Path(path) => QuarantineCache::load(path.clone()),
    }
}

// ============================================================================
// Orchestration
// ============================================================================

/// Run a full discovery pass.
///
/// Per-candidate failures drop the candidate from the results; a rate-limit
/// failure instead yields an explicit `RateLimited` entry. Only systemic
/// problems (a rate-limited search, an unwritable cache at the final save)
/// error out.
pub async fn discover_sources<A: GitHubApi>(
    api: &A,
    options: &DiscoverOptions,
    events: &EventSender,
) -> Result<Vec<ProjectSource>> {
    events.emit(DiscoveryEvent::Started {
        query_count: options.queries.len(),
        limit: options.limit,
    });

    let quarantine = resolve_quarantine_cache(&options.quarantine_cache);
    let run_cache = options
        .verify_failures
        .then(|| resolve_run_cache(&options.run_cache));

    // Phase 1: collection
    let (candidates, skipped_quarantined, skipped_low_stars) =
        collect_candidates(api, options, &quarantine, events).await?;
    events.emit(DiscoveryEvent::SearchCompleted {
        candidates: candidates.len(),
        skipped_quarantined,
        skipped_low_stars,
    });

    // Phase 2: concurrent analysis
    let total = candidates.len();
    let completed = AtomicUsize::new(0);
    let outcomes: Vec<Option<ProjectSource>> = stream::iter(candidates.iter())
        .map(|candidate| {
            analyze_with_isolation(
                api,
                candidate,
                options,
                run_cache.as_ref(),
                &completed,
                total,
                events,
            )
        })
        .buffer_unordered(MAX_WORKERS)
        .collect()
        .await;
    let mut sources: Vec<ProjectSource> = outcomes.into_iter().flatten().collect();

    // Phase 3: quarantine updates
    for source in &sources {
        if source.status == SourceStatus::Compatible {
            let _ = quarantine.remove(&source.repo);
        } else if should_quarantine(source.status) {
            let _ = quarantine.set(&source.repo, source.status);
        }
    }
    quarantine
        .save()
        .context("Failed to save quarantine cache")?;
    if let Some(cache) = &run_cache {
        cache.save().context("Failed to save run cache")?;
    }

    sort_sources(&mut sources);

    let mut stats: HashMap<SourceStatus, usize> = HashMap::new();
    for source in &sources {
        *stats.entry(source.status).or_insert(0) += 1;
    }
    events.emit(DiscoveryEvent::Completed {
        total: sources.len(),
        stats,
    });

    Ok(sources)
}

/// Phase 1: run each query, deduplicate, apply quarantine and star filters,
/// and stop at the limit. A rate-limited search aborts the pass; any other
/// query failure skips that query.
async fn collect_candidates<A: GitHubApi>(
    api: &A,
    options: &DiscoverOptions,
    quarantine: &QuarantineCache,
    events: &EventSender,
) -> Result<(Vec<Candidate>, usize, usize)> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut accepted: Vec<Candidate> = Vec::new();
    let mut skipped_quarantined = 0;
    let mut skipped_low_stars = 0;
    let per_page = options.limit.clamp(1, 100) as u32;

    for query in &options.queries {
        if accepted.len() >= options.limit {
            break;
        }
        let repos = match api.search_repos(query, per_page).await {
            Ok(repos) => repos,
            Err(err) if err.is_rate_limit() => {
                return Err(err).context("Search aborted by rate limit")
            }
            Err(_) => {
                events.emit(DiscoveryEvent::QueryCompleted {
                    query: query.clone(),
                    found: 0,
                });
                continue;
            }
        };

        let mut found = 0;
        for repo in repos {
            if accepted.len() >= options.limit {
                break;
            }
            if !seen.insert(repo.clone()) {
                continue;
            }
            if !options.bypass_quarantine && quarantine.is_quarantined(&repo) {
                skipped_quarantined += 1;
                continue;
            }
            let mut stars = None;
            if options.min_stars > 0 {
                match api.get_repo_stars(&repo).await {
                    Ok(count) if count < options.min_stars => {
                        skipped_low_stars += 1;
                        continue;
                    }
                    Ok(count) => stars = Some(count),
                    Err(err) if err.is_rate_limit() => {
                        return Err(err).context("Star lookup aborted by rate limit")
                    }
                    Err(_) => continue,
                }
            }
            accepted.push(Candidate { repo, stars });
            found += 1;
        }
        events.emit(DiscoveryEvent::QueryCompleted {
            query: query.clone(),
            found,
        });
    }

    Ok((accepted, skipped_quarantined, skipped_low_stars))
}

// ============================================================================
// Per-Candidate Analysis
// ============================================================================

struct Analysis {
    source: ProjectSource,
    picked_artifact: Option<String>,
    failure_count: Option<u32>,
    cache_hit: bool,
}

/// Wrap [`analyze_candidate`] with the fault-isolation contract: errors drop
/// the candidate, rate limits produce an explicit result, and the completion
/// event fires either way so progress counts stay truthful.
async fn analyze_with_isolation<A: GitHubApi>(
    api: &A,
    candidate: &Candidate,
    options: &DiscoverOptions,
    run_cache: Option<&RunCache>,
    completed: &AtomicUsize,
    total: usize,
    events: &EventSender,
) -> Option<ProjectSource> {
    events.emit(DiscoveryEvent::AnalysisStarted {
        repo: candidate.repo.clone(),
    });
    let started = Instant::now();
    let outcome = analyze_candidate(api, candidate, options, run_cache, events).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;

    match outcome {
        Ok(analysis) => {
            events.emit(DiscoveryEvent::AnalysisCompleted {
                repo: candidate.repo.clone(),
                status: analysis.source.status,
                artifact: analysis.picked_artifact.clone(),
                failure_count: analysis.failure_count,
                cache_hit: analysis.cache_hit,
                elapsed_ms,
                completed: done,
                total,
            });
            Some(analysis.source)
        }
        Err(err) if err.is_rate_limit() => {
            let source = ProjectSource::bare(
                candidate.repo.clone(),
                candidate.stars.unwrap_or(0),
                SourceStatus::RateLimited,
            );
            events.emit(DiscoveryEvent::AnalysisCompleted {
                repo: candidate.repo.clone(),
                status: SourceStatus::RateLimited,
                artifact: None,
                failure_count: None,
                cache_hit: false,
                elapsed_ms,
                completed: done,
                total,
            });
            Some(source)
        }
        Err(_) => {
            // No facts were gathered; report the weakest status and omit the
            // repo from the results.
            events.emit(DiscoveryEvent::AnalysisCompleted {
                repo: candidate.repo.clone(),
                status: SourceStatus::NoArtifacts,
                artifact: None,
                failure_count: None,
                cache_hit: false,
                elapsed_ms,
                completed: done,
                total,
            });
            None
        }
    }
}

async fn analyze_candidate<A: GitHubApi>(
    api: &A,
    candidate: &Candidate,
    options: &DiscoverOptions,
    run_cache: Option<&RunCache>,
    events: &EventSender,
) -> Result<Analysis, ApiError> {
    let repo = &candidate.repo;
    let progress = |stage: String| {
        events.emit(DiscoveryEvent::AnalysisProgress {
            repo: repo.clone(),
            stage,
        });
    };

    let stars = match candidate.stars {
        Some(stars) => stars,
        None => {
            progress("fetching info".to_string());
            api.get_repo_stars(repo).await?
        }
    };

    progress("fetching runs".to_string());
    let runs = api.get_failed_runs(repo, MAX_RUNS_TO_CHECK as u32).await?;
    let (run, artifacts) = locate_run_with_artifacts(api, repo, &runs).await?;

    let artifact_names: Vec<String> = artifacts.iter().map(|a| a.name.clone()).collect();
    let report_artifacts: Vec<String> = artifact_names
        .iter()
        .filter(|name| is_report_artifact(name))
        .cloned()
        .collect();

    let mut failure_count = None;
    let mut cache_hit = false;
    let mut picked_artifact = None;

    if options.verify_failures && !report_artifacts.is_empty() {
        if let Some(run) = &run {
            progress("checking cache".to_string());
            if let Some(cache) = run_cache {
                if let Some(count) = cache.get(run.id) {
                    failure_count = Some(count);
                    cache_hit = true;
                }
            }

            if !cache_hit {
                let failed_jobs = match api.get_failed_job_names(repo, run.id).await {
                    Ok(jobs) => jobs,
                    Err(err) if err.is_rate_limit() => return Err(err),
                    // Job data only improves artifact selection
                    Err(_) => Vec::new(),
                };
                let selected = select_best_artifact(&artifacts, &failed_jobs)
                    .or_else(|| artifacts.iter().find(|a| is_report_artifact(&a.name)));

                if let Some(artifact) = selected {
                    picked_artifact = Some(artifact.name.clone());
                    progress(format!("dl {}", format_size(artifact.size_in_bytes)));
                    let bytes = api.download_artifact(repo, artifact.id).await?;
                    match extract_failure_count(&bytes, MAX_NESTED_DEPTH) {
                        Ok(count) => {
                            failure_count = count;
                            if let (Some(count), Some(cache)) = (count, run_cache) {
                                let _ = cache.set(run.id, count, run.created_at);
                            }
                        }
                        Err(UnsupportedFormat) => {
                            return Ok(Analysis {
                                source: ProjectSource {
                                    repo: repo.clone(),
                                    stars,
                                    status: SourceStatus::UnsupportedFormat,
                                    artifact_names,
                                    report_artifacts,
                                    run_id: Some(run.id),
                                    run_url: Some(run.html_url.clone()),
                                },
                                picked_artifact,
                                failure_count: None,
                                cache_hit: false,
                            });
                        }
                    }
                }
            }
        }
    }

    let status = classify(run.as_ref(), &artifact_names, &report_artifacts, failure_count);
    let source = ProjectSource {
        repo: repo.clone(),
        stars,
        status,
        artifact_names,
        report_artifacts,
        run_id: run.as_ref().map(|r| r.id),
        run_url: run.as_ref().map(|r| r.html_url.clone()),
    };
    Ok(Analysis {
        source,
        picked_artifact,
        failure_count,
        cache_hit,
    })
}

/// Walk recent failed runs looking for one with live (non-expired) artifacts,
/// preferring a run that kept a report-like artifact. Falls back to the first
/// run with any artifacts, then to the newest run bare.
async fn locate_run_with_artifacts<A: GitHubApi>(
    api: &A,
    repo: &str,
    runs: &[WorkflowRun],
) -> Result<(Option<WorkflowRun>, Vec<ArtifactInfo>), ApiError> {
    let mut fallback: Option<(WorkflowRun, Vec<ArtifactInfo>)> = None;

    for run in runs {
        let artifacts: Vec<ArtifactInfo> = api
            .get_run_artifacts(repo, run.id)
            .await?
            .into_iter()
            .filter(|a| !a.expired)
            .collect();
        if artifacts.is_empty() {
            continue;
        }
        if artifacts.iter().any(|a| is_report_artifact(&a.name)) {
            return Ok((Some(run.clone()), artifacts));
        }
        if fallback.is_none() {
            fallback = Some((run.clone(), artifacts));
        }
    }

    if let Some((run, artifacts)) = fallback {
        return Ok((Some(run), artifacts));
    }
    Ok((runs.first().cloned(), Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::{Cursor, Write};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn run_fixture(id: u64) -> WorkflowRun {
        WorkflowRun {
            id,
            created_at: Utc::now() - chrono::Duration::days(1),
            html_url: format!("https://github.com/x/y/actions/runs/{}", id),
        }
    }

    fn artifact_fixture(id: u64, name: &str) -> ArtifactInfo {
        ArtifactInfo {
            id,
            name: name.to_string(),
            size_in_bytes: 2048,
            expired: false,
        }
    }

    /// In-memory API double. Repo data is keyed by `owner/repo`; runs and
    /// artifacts are shared fixtures addressed by id.
    #[derive(Default)]
    struct FakeApi {
        repos: Vec<String>,
        stars: HashMap<String, u32>,
        runs: HashMap<String, Vec<WorkflowRun>>,
        artifacts: HashMap<u64, Vec<ArtifactInfo>>,
        jobs: HashMap<u64, Vec<String>>,
        downloads: HashMap<u64, Vec<u8>>,
        rate_limited_repos: Vec<String>,
        failing_repos: Vec<String>,
        download_calls: AtomicUsize,
        runs_in_flight: AtomicUsize,
        runs_peak: AtomicUsize,
    }

    impl FakeApi {
        fn with_compatible_repos(count: usize) -> Self {
            let mut api = FakeApi::default();
            for i in 0..count {
                let repo = format!("owner/repo{:02}", i);
                api.stars.insert(repo.clone(), 100 + i as u32);
                api.runs.insert(repo.clone(), vec![run_fixture(1000 + i as u64)]);
                api.artifacts.insert(
                    1000 + i as u64,
                    vec![artifact_fixture(5000 + i as u64, "playwright-report")],
                );
                api.repos.push(repo);
            }
            api
        }
    }

    impl GitHubApi for FakeApi {
        async fn search_repos(&self, _query: &str, per_page: u32) -> Result<Vec<String>, ApiError> {
            Ok(self.repos.iter().take(per_page as usize).cloned().collect())
        }

        async fn get_repo_stars(&self, repo: &str) -> Result<u32, ApiError> {
            Ok(self.stars.get(repo).copied().unwrap_or(0))
        }

        async fn get_failed_runs(
            &self,
            repo: &str,
            _per_page: u32,
        ) -> Result<Vec<WorkflowRun>, ApiError> {
            if self.rate_limited_repos.iter().any(|r| r == repo) {
                return Err(ApiError::RateLimited("API rate limit exceeded".to_string()));
            }
            if self.failing_repos.iter().any(|r| r == repo) {
                return Err(ApiError::failed(Some(500), "server error".to_string()));
            }
            let now = self.runs_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.runs_peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.runs_in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(self.runs.get(repo).cloned().unwrap_or_default())
        }

        async fn get_run_artifacts(
            &self,
            _repo: &str,
            run_id: u64,
        ) -> Result<Vec<ArtifactInfo>, ApiError> {
            Ok(self.artifacts.get(&run_id).cloned().unwrap_or_default())
        }

        async fn get_failed_job_names(
            &self,
            _repo: &str,
            run_id: u64,
        ) -> Result<Vec<String>, ApiError> {
            Ok(self.jobs.get(&run_id).cloned().unwrap_or_default())
        }

        async fn download_artifact(
            &self,
            _repo: &str,
            artifact_id: u64,
        ) -> Result<Vec<u8>, ApiError> {
            self.download_calls.fetch_add(1, Ordering::SeqCst);
            match self.downloads.get(&artifact_id) {
                Some(bytes) => Ok(bytes.clone()),
                None => Err(ApiError::failed(Some(404), "no such artifact".to_string())),
            }
        }
    }

    fn unverified_options() -> DiscoverOptions {
        DiscoverOptions {
            verify_failures: false,
            run_cache: CacheLocation::Disabled,
            quarantine_cache: CacheLocation::Disabled,
            ..DiscoverOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_caps_results() {
        let api = FakeApi::with_compatible_repos(50);
        let options = DiscoverOptions {
            limit: 10,
            ..unverified_options()
        };

        let sources = discover_sources(&api, &options, &EventSender::disabled())
            .await
            .unwrap();
        assert_eq!(sources.len(), 10);
        assert!(sources
            .iter()
            .all(|s| s.status == SourceStatus::Compatible));
        // Classification only; nothing was downloaded
        assert_eq!(api.download_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_search_hits_collapse() {
        let mut api = FakeApi::with_compatible_repos(3);
        let repeated = api.repos.clone();
        api.repos.extend(repeated);

        let sources = discover_sources(&api, &unverified_options(), &EventSender::disabled())
            .await
            .unwrap();
        assert_eq!(sources.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_pool_stays_bounded() {
        let api = FakeApi::with_compatible_repos(20);
        discover_sources(&api, &unverified_options(), &EventSender::disabled())
            .await
            .unwrap();
        let peak = api.runs_peak.load(Ordering::SeqCst);
        assert!(peak <= MAX_WORKERS, "peak concurrency was {}", peak);
        assert!(peak > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_stars_filters_during_collection() {
        let mut api = FakeApi::with_compatible_repos(2);
        api.stars.insert("owner/repo00".to_string(), 10);
        api.stars.insert("owner/repo01".to_string(), 5000);

        let (tx, rx) = mpsc::channel();
        let options = DiscoverOptions {
            min_stars: 100,
            ..unverified_options()
        };
        let sources = discover_sources(&api, &options, &EventSender::new(tx))
            .await
            .unwrap();

        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].repo, "owner/repo01");
        assert_eq!(sources[0].stars, 5000);

        let skipped = rx
            .try_iter()
            .find_map(|event| match event {
                DiscoveryEvent::SearchCompleted {
                    skipped_low_stars, ..
                } => Some(skipped_low_stars),
                _ => None,
            })
            .unwrap();
        assert_eq!(skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quarantined_repos_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(QUARANTINE_CACHE_FILE);
        let seeded = QuarantineCache::load(path.clone());
        seeded
            .set("owner/repo00", SourceStatus::NoArtifacts)
            .unwrap();
        drop(seeded);

        let api = FakeApi::with_compatible_repos(3);
        let (tx, rx) = mpsc::channel();
        let options = DiscoverOptions {
            quarantine_cache: CacheLocation::Path(path),
            ..unverified_options()
        };
        let sources = discover_sources(&api, &options, &EventSender::new(tx))
            .await
            .unwrap();

        assert_eq!(sources.len(), 2);
        assert!(sources.iter().all(|s| s.repo != "owner/repo00"));

        let skipped = rx
            .try_iter()
            .find_map(|event| match event {
                DiscoveryEvent::SearchCompleted {
                    skipped_quarantined,
                    ..
                } => Some(skipped_quarantined),
                _ => None,
            })
            .unwrap();
        assert_eq!(skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bypass_analyzes_quarantined_repos() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(QUARANTINE_CACHE_FILE);
        let seeded = QuarantineCache::load(path.clone());
        seeded
            .set("owner/repo00", SourceStatus::NoArtifacts)
            .unwrap();
        drop(seeded);

        let api = FakeApi::with_compatible_repos(1);
        let options = DiscoverOptions {
            quarantine_cache: CacheLocation::Path(path.clone()),
            bypass_quarantine: true,
            ..unverified_options()
        };
        let sources = discover_sources(&api, &options, &EventSender::disabled())
            .await
            .unwrap();

        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].status, SourceStatus::Compatible);

        // A compatible result clears the old quarantine entry
        let reloaded = QuarantineCache::load(path);
        assert!(!reloaded.is_quarantined("owner/repo00"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_end_repos_are_quarantined() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(QUARANTINE_CACHE_FILE);

        let mut api = FakeApi::with_compatible_repos(1);
        // repo00 has no failed runs at all
        api.runs.insert("owner/repo00".to_string(), Vec::new());

        let options = DiscoverOptions {
            quarantine_cache: CacheLocation::Path(path.clone()),
            ..unverified_options()
        };
        let sources = discover_sources(&api, &options, &EventSender::disabled())
            .await
            .unwrap();
        assert_eq!(sources[0].status, SourceStatus::NoFailedRuns);

        let reloaded = QuarantineCache::load(path);
        assert!(reloaded.is_quarantined("owner/repo00"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_repo_yields_explicit_result() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(QUARANTINE_CACHE_FILE);

        let mut api = FakeApi::with_compatible_repos(2);
        api.rate_limited_repos.push("owner/repo00".to_string());

        let options = DiscoverOptions {
            quarantine_cache: CacheLocation::Path(path.clone()),
            ..unverified_options()
        };
        let sources = discover_sources(&api, &options, &EventSender::disabled())
            .await
            .unwrap();

        let rate_limited = sources
            .iter()
            .find(|s| s.repo == "owner/repo00")
            .unwrap();
        assert_eq!(rate_limited.status, SourceStatus::RateLimited);

        // Rate-limited results say nothing about the repo itself
        let reloaded = QuarantineCache::load(path);
        assert!(!reloaded.is_quarantined("owner/repo00"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_repo_is_omitted() {
        let mut api = FakeApi::with_compatible_repos(3);
        api.failing_repos.push("owner/repo01".to_string());

        let (tx, rx) = mpsc::channel();
        let sources = discover_sources(&api, &unverified_options(), &EventSender::new(tx))
            .await
            .unwrap();

        assert_eq!(sources.len(), 2);
        assert!(sources.iter().all(|s| s.repo != "owner/repo01"));

        // Progress still counted the dropped repo
        let completions = rx
            .try_iter()
            .filter(|event| matches!(event, DiscoveryEvent::AnalysisCompleted { .. }))
            .count();
        assert_eq!(completions, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_downloads_and_counts_failures() {
        let mut api = FakeApi::with_compatible_repos(1);
        let report = build_zip(&[("report.json", br#"{"stats": {"unexpected": 2, "flaky": 1}}"#)]);
        api.downloads.insert(5000, report);

        let (tx, rx) = mpsc::channel();
        let options = DiscoverOptions {
            verify_failures: true,
            run_cache: CacheLocation::Disabled,
            quarantine_cache: CacheLocation::Disabled,
            ..DiscoverOptions::default()
        };
        let sources = discover_sources(&api, &options, &EventSender::new(tx))
            .await
            .unwrap();

        assert_eq!(sources[0].status, SourceStatus::Compatible);
        assert_eq!(api.download_calls.load(Ordering::SeqCst), 1);

        let (count, cache_hit) = rx
            .try_iter()
            .find_map(|event| match event {
                DiscoveryEvent::AnalysisCompleted {
                    failure_count,
                    cache_hit,
                    ..
                } => Some((failure_count, cache_hit)),
                _ => None,
            })
            .unwrap();
        assert_eq!(count, Some(3));
        assert!(!cache_hit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verified_zero_failures_downgrades() {
        let mut api = FakeApi::with_compatible_repos(1);
        let report = build_zip(&[("report.json", br#"{"stats": {"unexpected": 0, "flaky": 0}}"#)]);
        api.downloads.insert(5000, report);

        let options = DiscoverOptions {
            verify_failures: true,
            run_cache: CacheLocation::Disabled,
            quarantine_cache: CacheLocation::Disabled,
            ..DiscoverOptions::default()
        };
        let sources = discover_sources(&api, &options, &EventSender::disabled())
            .await
            .unwrap();
        assert_eq!(sources[0].status, SourceStatus::NoFailures);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_run_skips_download() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(RUN_CACHE_FILE);
        let seeded = RunCache::load(path.clone());
        seeded.set(1000, 5, Utc::now()).unwrap();
        drop(seeded);

        let api = FakeApi::with_compatible_repos(1);
        let (tx, rx) = mpsc::channel();
        let options = DiscoverOptions {
            verify_failures: true,
            run_cache: CacheLocation::Path(path),
            quarantine_cache: CacheLocation::Disabled,
            ..DiscoverOptions::default()
        };
        let sources = discover_sources(&api, &options, &EventSender::new(tx))
            .await
            .unwrap();

        assert_eq!(sources[0].status, SourceStatus::Compatible);
        assert_eq!(api.download_calls.load(Ordering::SeqCst), 0);

        let cache_hit = rx
            .try_iter()
            .find_map(|event| match event {
                DiscoveryEvent::AnalysisCompleted { cache_hit, .. } => Some(cache_hit),
                _ => None,
            })
            .unwrap();
        assert!(cache_hit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bundled_report_is_unsupported_not_quarantined() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(QUARANTINE_CACHE_FILE);

        let mut api = FakeApi::with_compatible_repos(1);
        let bundled = build_zip(&[
            ("index.html", b"<html></html>"),
            ("data/shot.png", b"\x89PNG"),
        ]);
        api.downloads.insert(5000, bundled);

        let options = DiscoverOptions {
            verify_failures: true,
            run_cache: CacheLocation::Disabled,
            quarantine_cache: CacheLocation::Path(path.clone()),
            ..DiscoverOptions::default()
        };
        let sources = discover_sources(&api, &options, &EventSender::disabled())
            .await
            .unwrap();

        assert_eq!(sources[0].status, SourceStatus::UnsupportedFormat);
        let reloaded = QuarantineCache::load(path);
        assert!(!reloaded.is_quarantined("owner/repo00"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_sorted_compatible_then_stars() {
        let mut api = FakeApi::with_compatible_repos(3);
        // repo01 only has unrelated artifacts
        api.artifacts
            .insert(1001, vec![artifact_fixture(9001, "coverage")]);
        api.stars.insert("owner/repo00".to_string(), 10);
        api.stars.insert("owner/repo01".to_string(), 9999);
        api.stars.insert("owner/repo02".to_string(), 500);

        let options = DiscoverOptions {
            // Force star fetches so sorting has real values
            min_stars: 1,
            ..unverified_options()
        };
        let sources = discover_sources(&api, &options, &EventSender::disabled())
            .await
            .unwrap();

        let order: Vec<&str> = sources.iter().map(|s| s.repo.as_str()).collect();
        assert_eq!(order, vec!["owner/repo02", "owner/repo00", "owner/repo01"]);
        assert_eq!(sources[2].status, SourceStatus::HasArtifacts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_artifacts_are_ignored() {
        let mut api = FakeApi::with_compatible_repos(1);
        let mut expired = artifact_fixture(5000, "playwright-report");
        expired.expired = true;
        api.artifacts.insert(1000, vec![expired]);

        let sources = discover_sources(&api, &unverified_options(), &EventSender::disabled())
            .await
            .unwrap();
        assert_eq!(sources[0].status, SourceStatus::NoArtifacts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefers_run_with_report_artifacts() {
        let mut api = FakeApi::default();
        let repo = "owner/picky".to_string();
        api.stars.insert(repo.clone(), 42);
        api.runs.insert(
            repo.clone(),
            vec![run_fixture(1), run_fixture(2), run_fixture(3)],
        );
        // Newest run kept only logs; an older one kept a report
        api.artifacts.insert(1, vec![artifact_fixture(11, "build-logs")]);
        api.artifacts.insert(2, vec![]);
        api.artifacts
            .insert(3, vec![artifact_fixture(31, "blob-report-1")]);
        api.repos.push(repo);

        let sources = discover_sources(&api, &unverified_options(), &EventSender::disabled())
            .await
            .unwrap();
        assert_eq!(sources[0].run_id, Some(3));
        assert_eq!(sources[0].status, SourceStatus::Compatible);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_sequence_for_single_repo() {
        let api = FakeApi::with_compatible_repos(1);
        let (tx, rx) = mpsc::channel();
        discover_sources(&api, &unverified_options(), &EventSender::new(tx))
            .await
            .unwrap();

        let events: Vec<DiscoveryEvent> = rx.try_iter().collect();
        assert!(matches!(events.first(), Some(DiscoveryEvent::Started { .. })));
        assert!(matches!(events.last(), Some(DiscoveryEvent::Completed { .. })));

        let started = events
            .iter()
            .position(|e| matches!(e, DiscoveryEvent::AnalysisStarted { .. }))
            .unwrap();
        let completed = events
            .iter()
            .position(|e| matches!(e, DiscoveryEvent::AnalysisCompleted { .. }))
            .unwrap();
        assert!(started < completed);

        let stats = events
            .iter()
            .find_map(|e| match e {
                DiscoveryEvent::Completed { stats, .. } => Some(stats.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(stats.get(&SourceStatus::Compatible), Some(&1));
    }
}
