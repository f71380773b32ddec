//! Conbench client
//!
//! Fetches run comparisons between a contender commit and the baseline commit
//! Conbench records for it. Retrying is left to the pipeline: this client only
//! reports whether a failure is worth another attempt.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use benchalerts_core::model::TAG_DELIMITER;
use benchalerts_core::{
    BenchmarkComparison, CommitGraph, ComparisonSource, FetchRequest, FetchedComparisons, Run,
    RunComparisonSet, SourceError, Verdict,
};

use crate::error::{check_status, read_json, ClientError};

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for a Conbench server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConbenchConfig {
    /// Server URL, without the `/api` suffix
    pub url: String,
    /// Login email (private servers only)
    pub email: Option<String>,
    /// Login password (private servers only)
    pub password: Option<String>,
}

impl ConbenchConfig {
    pub fn new(url: &str) -> Self {
        ConbenchConfig {
            url: url.trim_end_matches('/').to_string(),
            email: None,
            password: None,
        }
    }

    /// Read `CONBENCH_URL`, `CONBENCH_EMAIL` and `CONBENCH_PASSWORD`.
    pub fn from_env() -> anyhow::Result<Self> {
        let url = std::env::var("CONBENCH_URL").context("environment variable CONBENCH_URL not found")?;
        let mut config = Self::new(&url);
        config.email = std::env::var("CONBENCH_EMAIL").ok();
        config.password = std::env::var("CONBENCH_PASSWORD").ok();
        Ok(config)
    }

    pub fn with_login(mut self, email: &str, password: &str) -> Self {
        self.email = Some(email.to_string());
        self.password = Some(password.to_string());
        self
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (self.email.as_deref(), self.password.as_deref()) {
            (Some(email), Some(password)) if !email.is_empty() && !password.is_empty() => {
                Some((email, password))
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CommitInfo {
    #[serde(default)]
    parent_sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitComparison {
    #[serde(default)]
    runs: Vec<RunPair>,
}

#[derive(Debug, Deserialize)]
struct RunPair {
    baseline: Option<RunRef>,
    contender: RunRef,
}

#[derive(Debug, Deserialize)]
struct RunRef {
    run_id: String,
}

/// One benchmark row of `GET /api/compare/runs/{baseline}...{contender}`.
#[derive(Debug, Deserialize)]
pub(crate) struct CompareEntry {
    benchmark: String,
    #[serde(default)]
    tags: Option<Map<String, Value>>,
    #[serde(default)]
    contender_run_id: Option<String>,
    #[serde(default)]
    contender_z_regression: Option<bool>,
    #[serde(default)]
    contender_z_improvement: Option<bool>,
}

impl CompareEntry {
    fn verdict(&self) -> Verdict {
        match (self.contender_z_regression, self.contender_z_improvement) {
            (Some(true), _) => Verdict::Regressed,
            (_, Some(true)) => Verdict::Improved,
            (Some(false), Some(false)) => Verdict::Unchanged,
            _ => Verdict::Unknown,
        }
    }

    /// Display tags: Conbench's `benchmark` string split on the delimiter,
    /// which keeps the server's order. Entries with an empty `benchmark` fall
    /// back to the string tag values sorted by key, minus `name`.
    fn tags(&self) -> Vec<String> {
        if !self.benchmark.trim().is_empty() {
            return self.benchmark.split(TAG_DELIMITER).map(str::to_string).collect();
        }
        let mut from_tags: Vec<(&str, &str)> = self
            .tags
            .iter()
            .flat_map(|tags| tags.iter())
            .filter(|(key, _)| key.as_str() != "name")
            .filter_map(|(key, value)| value.as_str().map(|v| (key.as_str(), v)))
            .collect();
        from_tags.sort_by_key(|(key, _)| *key);
        from_tags.into_iter().map(|(_, value)| value.to_string()).collect()
    }

    /// Benchmark name from `tags.name`, else the `benchmark` string.
    fn name(&self) -> String {
        self.tags
            .as_ref()
            .and_then(|tags| tags.get("name"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.benchmark)
            .to_string()
    }

    pub(crate) fn into_comparison(self) -> BenchmarkComparison {
        let comparison = BenchmarkComparison::new(self.name(), self.tags(), self.verdict());
        match self.contender_run_id {
            Some(run_id) => comparison.with_run_id(run_id),
            None => comparison,
        }
    }
}

/// Statuses worth retrying: rate limiting and gateway trouble.
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

fn source_error(err: ClientError) -> SourceError {
    let transient = err.is_retryable_transport() || err.status().is_some_and(is_retryable_status);
    if transient {
        SourceError::Transient(err.to_string())
    } else {
        SourceError::Other(err.into())
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Conbench API client. Session cookies from the login are kept for later calls.
pub struct ConbenchClient {
    config: ConbenchConfig,
    api_base: String,
    http: reqwest::Client,
}

impl ConbenchClient {
    /// Build a client without contacting the server.
    pub fn new(config: ConbenchConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("benchalerts/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .cookie_store(true)
            .build()
            .context("failed to create HTTP client")?;

        Ok(ConbenchClient {
            api_base: format!("{}/api", config.url),
            config,
            http,
        })
    }

    /// Build a client and log in when credentials are configured.
    pub async fn connect(config: ConbenchConfig) -> anyhow::Result<Self> {
        let client = Self::new(config)?;
        client.login().await.context("Conbench login failed")?;
        Ok(client)
    }

    pub fn config(&self) -> &ConbenchConfig {
        &self.config
    }

    /// `POST /api/login/`; a no-op for public servers.
    pub async fn login(&self) -> Result<(), ClientError> {
        let Some((email, password)) = self.config.credentials() else {
            debug!("No Conbench credentials configured, skipping login");
            return Ok(());
        };
        let url = format!("{}/login/", self.api_base);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;
        check_status(response).await?;
        info!("Logged in to Conbench at {}", self.config.url);
        Ok(())
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ClientError> {
        let url = format!("{}{}", self.api_base, path);
        debug!("GET {} {:?}", url, query);
        let response = self.http.get(&url).query(query).send().await?;
        read_json(response).await
    }

    /// Parent SHA recorded for `sha`; `None` when Conbench has no parent for it.
    async fn parent_of(&self, sha: &str) -> Result<Option<String>, SourceError> {
        let commits: Vec<CommitInfo> = self
            .get("/commits/", &[("sha", sha.to_string())])
            .await
            .map_err(source_error)?;
        if commits.len() != 1 {
            return Err(SourceError::NoBaseline(format!(
                "found {} commits in Conbench that match the contender SHA '{}'",
                commits.len(),
                sha
            )));
        }
        Ok(commits
            .into_iter()
            .next()
            .and_then(|c| c.parent_sha)
            .filter(|parent| !parent.is_empty()))
    }
}

#[async_trait]
impl ComparisonSource for ConbenchClient {
    async fn fetch_comparisons(&self, request: &FetchRequest) -> Result<FetchedComparisons, SourceError> {
        let contender_sha = request.contender_sha.as_str();
        let baseline_sha = self.parent_of(contender_sha).await?.ok_or_else(|| {
            SourceError::NoBaseline(format!(
                "found the contender commit ({}) but it doesn't have a baseline commit in Conbench",
                contender_sha
            ))
        })?;

        let commit_compare: CommitComparison = self
            .get(&format!("/compare/commits/{}...{}", baseline_sha, contender_sha), &[])
            .await
            .map_err(source_error)?;
        if commit_compare.runs.is_empty() {
            return Err(SourceError::NoBaseline(format!(
                "contender commit '{}' doesn't have any runs in Conbench",
                contender_sha
            )));
        }

        let query: Vec<(&str, String)> = request
            .z_score_threshold
            .map(|z| vec![("threshold_z", z.to_string())])
            .unwrap_or_default();

        info!("Getting comparisons from {} runs", commit_compare.runs.len());
        let mut sets = Vec::with_capacity(commit_compare.runs.len());
        for pair in commit_compare.runs {
            let Some(baseline) = pair.baseline else {
                warn!("Contender run {} has no baseline run, skipping", pair.contender.run_id);
                continue;
            };
            let entries: Vec<CompareEntry> = self
                .get(
                    &format!("/compare/runs/{}...{}", baseline.run_id, pair.contender.run_id),
                    &query,
                )
                .await
                .map_err(source_error)?;

            let run = Run::new(
                pair.contender.run_id.clone(),
                contender_sha,
                baseline.run_id,
                pair.contender.run_id,
            );
            let comparisons = entries.into_iter().map(CompareEntry::into_comparison).collect();
            let set = RunComparisonSet::new(run, comparisons).map_err(|e| SourceError::Other(e.into()))?;
            sets.push(set);
        }

        if sets.is_empty() {
            return Err(SourceError::NoBaseline(format!(
                "no run of contender commit '{}' has a baseline run",
                contender_sha
            )));
        }

        Ok(FetchedComparisons {
            contender_sha: contender_sha.to_string(),
            baseline_sha,
            sets,
        })
    }
}

#[async_trait]
impl CommitGraph for ConbenchClient {
    async fn is_parent(&self, candidate_parent: &str, commit: &str) -> anyhow::Result<bool> {
        let parent = self
            .parent_of(commit)
            .await
            .with_context(|| format!("look up parent of {} in Conbench", commit))?;
        Ok(parent.as_deref() == Some(candidate_parent))
    }
}
