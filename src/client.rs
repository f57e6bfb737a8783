//! GitHub API client with global rate limiting
//!
//! Every outbound call goes through [`RateLimiter::run`], which holds one slot
//! of a shared semaphore for the duration of the request, paces dispatch with
//! a small jitter, and retries rate-limited calls with exponential backoff.
//! Timeouts and hard failures propagate immediately.

use crate::error::ApiError;
use crate::models::{ArtifactInfo, WorkflowRun};
use anyhow::{Context, Result};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = "failscout";
const API_VERSION: &str = "2022-11-28";

/// Timeout for metadata calls (search, runs, artifacts listings).
const API_TIMEOUT_SECS: u64 = 30;
/// Timeout for artifact downloads, which can run to tens of megabytes.
const DOWNLOAD_TIMEOUT_SECS: u64 = 120;

/// Upper bound on simultaneous in-flight calls, shared across all workers.
pub const MAX_CONCURRENT_CALLS: usize = 4;
/// Additional attempts after the first, for rate-limited calls only.
const MAX_RETRIES: u32 = 3;
/// Backoff grows as `RETRY_BASE_DELAY * 2^attempt` plus up to 1s of jitter.
const RETRY_BASE_DELAY_SECS: u64 = 2;

/// Maximum length for error body content in error messages
const MAX_ERROR_BODY_LEN: usize = 200;

// ============================================================================
// Error Sanitization
// ============================================================================

/// Sanitize an API error body before it enters an error message.
/// Truncates long responses and redacts anything that might carry a secret.
fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "bearer",
        "ghp_",
        "gho_",
        "ghu_",
        "github_pat_",
    ];

    let truncated = if body.chars().count() > MAX_ERROR_BODY_LEN {
        let head: String = body.chars().take(MAX_ERROR_BODY_LEN).collect();
        format!("{}... (truncated)", head)
    } else {
        body.to_string()
    };

    let lower = truncated.to_lowercase();
    for pattern in SECRET_PATTERNS {
        if lower.contains(pattern) {
            return "(error details redacted - may contain sensitive data)".to_string();
        }
    }

    truncated
}

/// Map a failed HTTP status to an [`ApiError`] with a useful message.
///
/// 403 bodies are inspected for rate-limit wording before sanitization so the
/// canonical message survives redaction and stays retryable.
fn status_error(status: u16, url: &str, body: &str) -> ApiError {
    let lower = body.to_lowercase();
    let message = match status {
        401 => "GitHub authentication failed (check GITHUB_TOKEN)".to_string(),
        403 if lower.contains("rate limit") => "GitHub API rate limit exceeded".to_string(),
        403 if lower.contains("abuse") => "GitHub API abuse detection triggered".to_string(),
        403 => format!("GitHub API access forbidden: {}", sanitize_error_body(body)),
        404 => format!("Not found: {}", url),
        _ => format!(
            "GitHub API error {}: {}",
            status,
            sanitize_error_body(body)
        ),
    };
    ApiError::failed(Some(status), message)
}

/// Map a transport-level failure, keeping timeouts distinct.
fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout(err.to_string())
    } else {
        ApiError::failed(err.status().map(|s| s.as_u16()), err.to_string())
    }
}

// ============================================================================
// Rate-Limited Call Path
// ============================================================================

/// Shared gate for all outbound API calls.
///
/// Cloning is cheap; clones share the same semaphore.
#[derive(Clone)]
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    max_retries: u32,
    base_delay: Duration,
}

impl RateLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        RateLimiter {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_retries: MAX_RETRIES,
            base_delay: Duration::from_secs(RETRY_BASE_DELAY_SECS),
        }
    }

    /// Execute `operation` under the concurrency bound.
    ///
    /// Holds a semaphore slot for the jitter pause plus the call itself.
    /// Rate-limited failures are retried up to `max_retries` times with
    /// exponential backoff slept *after* the slot is released, so a backing-off
    /// call never starves other workers. Timeouts and hard failures return on
    /// the first occurrence.
    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<T, ApiError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0;
        loop {
            let result = {
                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .expect("call semaphore never closed");
                let pause = rand::thread_rng().gen_range(50..=500);
                tokio::time::sleep(Duration::from_millis(pause)).await;
                operation().await
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_rate_limit() && attempt < self.max_retries => {
                    let backoff = self.base_delay.mul_f64(f64::powi(2.0, attempt as i32))
                        + Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..1.0));
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// ============================================================================
// API Surface
// ============================================================================

/// The remote operations discovery needs. Implemented by [`GitHubClient`];
/// tests substitute an in-memory fake.
pub trait GitHubApi {
    /// Search for repositories via code search; returns `owner/repo` names,
    /// possibly with duplicates across result items.
    fn search_repos(
        &self,
        query: &str,
        per_page: u32,
    ) -> impl Future<Output = Result<Vec<String>, ApiError>>;

    fn get_repo_stars(&self, repo: &str) -> impl Future<Output = Result<u32, ApiError>>;

    /// Most recent failed workflow runs, newest first.
    fn get_failed_runs(
        &self,
        repo: &str,
        per_page: u32,
    ) -> impl Future<Output = Result<Vec<WorkflowRun>, ApiError>>;

    fn get_run_artifacts(
        &self,
        repo: &str,
        run_id: u64,
    ) -> impl Future<Output = Result<Vec<ArtifactInfo>, ApiError>>;

    /// Names of jobs in the run that concluded with failure.
    fn get_failed_job_names(
        &self,
        repo: &str,
        run_id: u64,
    ) -> impl Future<Output = Result<Vec<String>, ApiError>>;

    /// Download an artifact archive as raw bytes.
    fn download_artifact(
        &self,
        repo: &str,
        artifact_id: u64,
    ) -> impl Future<Output = Result<Vec<u8>, ApiError>>;
}

// ============================================================================
// GitHub Client
// ============================================================================

#[derive(Deserialize)]
struct SearchResponse {
    items: Vec<SearchItem>,
}

#[derive(Deserialize)]
struct SearchItem {
    repository: SearchRepository,
}

#[derive(Deserialize)]
struct SearchRepository {
    full_name: String,
}

#[derive(Deserialize)]
struct RepoResponse {
    stargazers_count: u32,
}

#[derive(Deserialize)]
struct RunsResponse {
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Deserialize)]
struct ArtifactsResponse {
    artifacts: Vec<ArtifactInfo>,
}

#[derive(Deserialize)]
struct JobsResponse {
    jobs: Vec<Job>,
}

#[derive(Deserialize)]
struct Job {
    name: String,
    conclusion: Option<String>,
}

/// Live GitHub REST client. All calls go through the shared [`RateLimiter`].
pub struct GitHubClient {
    api: reqwest::Client,
    downloader: reqwest::Client,
    token: String,
    limiter: RateLimiter,
}

impl GitHubClient {
    /// Build a client around a caller-supplied bearer token.
    pub fn new(token: String, limiter: RateLimiter) -> Result<Self> {
        let api = reqwest::Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;
        let downloader = reqwest::Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .build()
            .context("Failed to create download client")?;
        Ok(GitHubClient {
            api,
            downloader,
            token,
            limiter,
        })
    }

    fn request(&self, client: &reqwest::Client, url: &str) -> reqwest::RequestBuilder {
        client
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let response = self
            .request(&self.api, url)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), url, &body));
        }
        response.json::<T>().await.map_err(transport_error)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        let response = self
            .request(&self.downloader, url)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), url, &body));
        }
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(bytes.to_vec())
    }
}

impl GitHubApi for GitHubClient {
    async fn search_repos(&self, query: &str, per_page: u32) -> Result<Vec<String>, ApiError> {
        let url = format!("{}/search/code", GITHUB_API);
        let params = [
            ("q", query.to_string()),
            ("per_page", per_page.to_string()),
        ];
        let url = url.as_str();
        let params = &params[..];
        let response: SearchResponse = self
            .limiter
            .run(move || self.fetch_json(url, params))
            .await?;
        Ok(response
            .items
            .into_iter()
            .map(|item| item.repository.full_name)
            .collect())
    }

    async fn get_repo_stars(&self, repo: &str) -> Result<u32, ApiError> {
        let url = format!("{}/repos/{}", GITHUB_API, repo);
        let url = url.as_str();
        let response: RepoResponse = self.limiter.run(move || self.fetch_json(url, &[])).await?;
        Ok(response.stargazers_count)
    }

    async fn get_failed_runs(&self, repo: &str, per_page: u32) -> Result<Vec<WorkflowRun>, ApiError> {
        let url = format!("{}/repos/{}/actions/runs", GITHUB_API, repo);
        let params = [
            ("status", "failure".to_string()),
            ("per_page", per_page.to_string()),
        ];
        let url = url.as_str();
        let params = &params[..];
        let response: RunsResponse = self
            .limiter
            .run(move || self.fetch_json(url, params))
            .await?;
        Ok(response.workflow_runs)
    }

    async fn get_run_artifacts(&self, repo: &str, run_id: u64) -> Result<Vec<ArtifactInfo>, ApiError> {
        let url = format!("{}/repos/{}/actions/runs/{}/artifacts", GITHUB_API, repo, run_id);
        let url = url.as_str();
        let response: ArtifactsResponse =
            self.limiter.run(move || self.fetch_json(url, &[])).await?;
        Ok(response.artifacts)
    }

    async fn get_failed_job_names(&self, repo: &str, run_id: u64) -> Result<Vec<String>, ApiError> {
        let url = format!("{}/repos/{}/actions/runs/{}/jobs", GITHUB_API, repo, run_id);
        let url = url.as_str();
        let response: JobsResponse = self.limiter.run(move || self.fetch_json(url, &[])).await?;
        Ok(response
            .jobs
            .into_iter()
            .filter(|job| job.conclusion.as_deref() == Some("failure"))
            .map(|job| job.name)
            .collect())
    }

    async fn download_artifact(&self, repo: &str, artifact_id: u64) -> Result<Vec<u8>, ApiError> {
        let url = format!(
            "{}/repos/{}/actions/artifacts/{}/zip",
            GITHUB_API, repo, artifact_id
        );
        let url = url.as_str();
        self.limiter.run(move || self.fetch_bytes(url)).await
    }
}
