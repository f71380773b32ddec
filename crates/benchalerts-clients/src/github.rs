//! GitHub report publisher
//!
//! Pull request targets get an issue comment, commit targets get a check run
//! or a commit status. Comments and check runs are upserted: a hidden marker
//! (comments) or `external_id` (check runs) derived from the idempotency key
//! finds the earlier post so it is edited instead of duplicated. Statuses
//! replace each other through their shared context.
//!
//! Requests authenticate with a personal access token ([`StaticToken`]) or as
//! a GitHub App installation ([`GitHubAppToken`]). Check runs need the latter.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use benchalerts_core::{
    Conclusion, PublishError, PublishReceipt, PublishRequest, PublishTarget, ReportPublisher,
};

use crate::error::{read_json, ClientError};

/// Name of the check run posted on commits.
pub const CHECK_RUN_NAME: &str = "Conbench regression analysis";

/// Context of the commit status posted on commits.
pub const STATUS_CONTEXT: &str = "conbench";

const DEFAULT_API_BASE: &str = "https://api.github.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const COMMENTS_PER_PAGE: usize = 100;
const STATUSES_PER_PAGE: usize = 100;
const ACCEPT_GITHUB_JSON: &str = "application/vnd.github+json";

/// GitHub rejects longer status descriptions.
const MAX_STATUS_DESCRIPTION: usize = 140;

/// App JWTs are backdated against clock drift; GitHub caps their lifetime at ten minutes.
const JWT_BACKDATE_SECS: u64 = 60;
const JWT_LIFETIME_SECS: u64 = 540;

/// Installation tokens expire after an hour.
const INSTALLATION_TOKEN_REFRESH: Duration = Duration::from_secs(50 * 60);

/// Hex characters of the key digest kept in the comment marker.
const MARKER_DIGEST_LEN: usize = 16;

/// Hidden HTML comment that identifies the report for `idempotency_key`.
pub fn comment_marker(idempotency_key: &str) -> String {
    let digest = hex::encode(Sha256::digest(idempotency_key.as_bytes()));
    format!("<!-- benchalerts:{} -->", &digest[..MARKER_DIGEST_LEN])
}

/// Supplies the bearer token for each request.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> anyhow::Result<String>;
}

/// A fixed personal access token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: &str) -> Self {
        StaticToken(token.to_string())
    }

    /// Read `GITHUB_API_TOKEN`.
    pub fn from_env() -> anyhow::Result<Self> {
        let token = std::env::var("GITHUB_API_TOKEN").context("environment variable GITHUB_API_TOKEN not found")?;
        Ok(Self::new(&token))
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(***)")
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iss: String,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct Installation {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationToken {
    token: String,
}

struct CachedToken {
    token: String,
    fetched_at: Instant,
}

/// Authenticates as a GitHub App installation.
///
/// Signs an RS256 JWT with the App's private key, exchanges it for an
/// installation access token and reuses that token until shortly before it
/// expires. The App is expected to have a single installation.
pub struct GitHubAppToken {
    app_id: String,
    key: EncodingKey,
    api_base: String,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl GitHubAppToken {
    /// `private_key_pem` is the key file downloaded from the App's settings page.
    pub fn new(app_id: &str, private_key_pem: &str) -> anyhow::Result<Self> {
        if app_id.trim().is_empty() {
            bail!("GitHub App ID is empty");
        }
        let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .context("GitHub App private key is not an RSA key in PEM format")?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("benchalerts/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to create HTTP client")?;

        Ok(GitHubAppToken {
            app_id: app_id.trim().to_string(),
            key,
            api_base: DEFAULT_API_BASE.to_string(),
            http,
            cached: Mutex::new(None),
        })
    }

    /// Read `GITHUB_APP_ID` and `GITHUB_APP_PRIVATE_KEY`.
    pub fn from_env() -> anyhow::Result<Self> {
        let app_id = std::env::var("GITHUB_APP_ID").context("environment variable GITHUB_APP_ID not found")?;
        let private_key = std::env::var("GITHUB_APP_PRIVATE_KEY")
            .context("environment variable GITHUB_APP_PRIVATE_KEY not found")?;
        Self::new(&app_id, &private_key)
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn app_jwt(&self) -> anyhow::Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock is before the Unix epoch")?
            .as_secs();
        let claims = AppClaims {
            iss: self.app_id.clone(),
            iat: now.saturating_sub(JWT_BACKDATE_SECS),
            exp: now + JWT_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .context("failed to sign GitHub App JWT")
    }

    async fn installation_token(&self) -> anyhow::Result<String> {
        let jwt = self.app_jwt()?;

        let url = format!("{}/app/installations", self.api_base);
        debug!("GET {}", url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&jwt)
            .header(reqwest::header::ACCEPT, ACCEPT_GITHUB_JSON)
            .send()
            .await
            .map_err(ClientError::from)?;
        let installations: Vec<Installation> = read_json(response).await?;
        let installation = installations
            .first()
            .with_context(|| format!("GitHub App {} is not installed anywhere", self.app_id))?;

        let url = format!("{}/app/installations/{}/access_tokens", self.api_base, installation.id);
        debug!("POST {}", url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&jwt)
            .header(reqwest::header::ACCEPT, ACCEPT_GITHUB_JSON)
            .send()
            .await
            .map_err(ClientError::from)?;
        let token: InstallationToken = read_json(response).await?;

        info!("Authenticated as GitHub App {} (installation {})", self.app_id, installation.id);
        Ok(token.token)
    }
}

impl std::fmt::Debug for GitHubAppToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubAppToken")
            .field("app_id", &self.app_id)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenProvider for GitHubAppToken {
    async fn token(&self) -> anyhow::Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.fetched_at.elapsed() < INSTALLATION_TOKEN_REFRESH {
                return Ok(entry.token.clone());
            }
        }
        let token = self
            .installation_token()
            .await
            .context("failed to get a GitHub App installation token")?;
        *cached = Some(CachedToken {
            token: token.clone(),
            fetched_at: Instant::now(),
        });
        Ok(token)
    }
}

#[derive(Debug, Deserialize)]
struct IssueComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckRun {
    id: u64,
    #[serde(default)]
    external_id: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckRunList {
    #[serde(default)]
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Deserialize)]
struct CommitStatus {
    id: u64,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    target_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullRequestRef {
    number: u64,
}

/// Commit status `state` for a report conclusion. No baseline is not a failure.
fn status_state(conclusion: Conclusion) -> &'static str {
    match conclusion {
        Conclusion::Pending => "pending",
        Conclusion::Success | Conclusion::Neutral => "success",
        Conclusion::Failure => "failure",
        Conclusion::Error => "error",
    }
}

fn status_description(title: &str) -> String {
    title.chars().take(MAX_STATUS_DESCRIPTION).collect()
}

/// Check run `status` and `conclusion` fields for a report conclusion.
fn check_state(conclusion: Conclusion) -> (&'static str, Option<&'static str>) {
    match conclusion {
        Conclusion::Pending => ("in_progress", None),
        Conclusion::Success => ("completed", Some("success")),
        Conclusion::Failure => ("completed", Some("failure")),
        Conclusion::Neutral | Conclusion::Error => ("completed", Some("neutral")),
    }
}

fn publish_error(err: ClientError) -> PublishError {
    match err.status() {
        Some(401 | 403 | 404 | 422) => PublishError::Rejected(err.to_string()),
        Some(429) | Some(500..=599) => PublishError::Transient(err.to_string()),
        _ if err.is_retryable_transport() => PublishError::Transient(err.to_string()),
        _ => PublishError::Other(err.into()),
    }
}

/// Client for one GitHub repository.
pub struct GitHubRepoClient {
    repo: String,
    base_url: String,
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl GitHubRepoClient {
    /// `repo` is `owner/name`.
    pub fn new(repo: &str, tokens: Arc<dyn TokenProvider>) -> anyhow::Result<Self> {
        if repo.split('/').filter(|part| !part.is_empty()).count() != 2 {
            anyhow::bail!("repository must look like 'owner/name', got '{}'", repo);
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("benchalerts/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to create HTTP client")?;

        Ok(GitHubRepoClient {
            repo: repo.to_string(),
            base_url: format!("{}/repos/{}", DEFAULT_API_BASE, repo),
            http,
            tokens,
        })
    }

    /// Point at another API root, e.g. GitHub Enterprise.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.base_url = format!("{}/repos/{}", api_base.trim_end_matches('/'), self.repo);
        self
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    async fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder, PublishError> {
        let token = self.tokens.token().await.context("failed to obtain GitHub token")?;
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, ACCEPT_GITHUB_JSON))
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T, PublishError> {
        let response = builder.send().await.map_err(|e| publish_error(e.into()))?;
        read_json(response).await.map_err(publish_error)
    }

    /// Number of the single pull request that contains `commit_sha`.
    pub async fn pull_number_for_commit(&self, commit_sha: &str) -> anyhow::Result<u64> {
        let builder = self
            .request(reqwest::Method::GET, &format!("/commits/{}/pulls", commit_sha))
            .await?;
        let pulls: Vec<PullRequestRef> = self.send(builder).await?;
        match pulls.as_slice() {
            [only] => Ok(only.number),
            _ => {
                let numbers: Vec<u64> = pulls.iter().map(|p| p.number).collect();
                bail!(
                    "need exactly 1 pull request associated with commit '{}', found {:?}",
                    commit_sha,
                    numbers
                )
            }
        }
    }

    async fn find_marked_comment(&self, pull_number: u64, marker: &str) -> Result<Option<IssueComment>, PublishError> {
        let mut page = 1usize;
        loop {
            let builder = self
                .request(reqwest::Method::GET, &format!("/issues/{}/comments", pull_number))
                .await?
                .query(&[("per_page", COMMENTS_PER_PAGE), ("page", page)]);
            let comments: Vec<IssueComment> = self.send(builder).await?;
            let count = comments.len();
            if let Some(found) = comments
                .into_iter()
                .find(|c| c.body.as_deref().is_some_and(|body| body.contains(marker)))
            {
                return Ok(Some(found));
            }
            if count < COMMENTS_PER_PAGE {
                return Ok(None);
            }
            page += 1;
        }
    }

    /// Create or edit the marked comment on a pull request.
    pub async fn upsert_comment(&self, pull_number: u64, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        let marker = comment_marker(&request.idempotency_key);
        let body = format!("{}\n{}\n", request.report, marker);
        let payload = json!({ "body": body });

        let (comment, updated_existing) = match self.find_marked_comment(pull_number, &marker).await? {
            Some(existing) => {
                let builder = self
                    .request(reqwest::Method::PATCH, &format!("/issues/comments/{}", existing.id))
                    .await?
                    .json(&payload);
                (self.send::<IssueComment>(builder).await?, true)
            }
            None => {
                let builder = self
                    .request(reqwest::Method::POST, &format!("/issues/{}/comments", pull_number))
                    .await?
                    .json(&payload);
                (self.send::<IssueComment>(builder).await?, false)
            }
        };

        info!(
            "{} comment {} on pull request #{}",
            if updated_existing { "Updated" } else { "Posted" },
            comment.id,
            pull_number
        );
        Ok(PublishReceipt {
            id: comment.id.to_string(),
            url: comment.html_url,
            updated_existing,
        })
    }

    async fn find_check_run(&self, commit_sha: &str, external_id: &str) -> Result<Option<CheckRun>, PublishError> {
        let builder = self
            .request(reqwest::Method::GET, &format!("/commits/{}/check-runs", commit_sha))
            .await?
            .query(&[("check_name", CHECK_RUN_NAME)]);
        let list: CheckRunList = self.send(builder).await?;
        Ok(list
            .check_runs
            .into_iter()
            .find(|run| run.external_id.as_deref() == Some(external_id)))
    }

    /// Create or edit the check run carrying this request's key.
    pub async fn upsert_check_run(&self, commit_sha: &str, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        let (status, conclusion) = check_state(request.conclusion);
        let mut payload = json!({
            "name": CHECK_RUN_NAME,
            "head_sha": commit_sha,
            "external_id": request.idempotency_key,
            "status": status,
            "output": {
                "title": request.title,
                "summary": request.report,
            },
        });
        if let Some(conclusion) = conclusion {
            payload["conclusion"] = json!(conclusion);
        }
        if let Some(url) = &request.details_url {
            payload["details_url"] = json!(url);
        }

        let (run, updated_existing) = match self.find_check_run(commit_sha, &request.idempotency_key).await? {
            Some(existing) => {
                let builder = self
                    .request(reqwest::Method::PATCH, &format!("/check-runs/{}", existing.id))
                    .await?
                    .json(&payload);
                (self.send::<CheckRun>(builder).await?, true)
            }
            None => {
                let builder = self
                    .request(reqwest::Method::POST, "/check-runs")
                    .await?
                    .json(&payload);
                (self.send::<CheckRun>(builder).await?, false)
            }
        };

        info!(
            "{} check run {} on {} ({})",
            if updated_existing { "Updated" } else { "Created" },
            run.id,
            commit_sha,
            conclusion.unwrap_or(status)
        );
        Ok(PublishReceipt {
            id: run.id.to_string(),
            url: run.html_url,
            updated_existing,
        })
    }

    async fn has_status(&self, commit_sha: &str) -> Result<bool, PublishError> {
        let builder = self
            .request(reqwest::Method::GET, &format!("/commits/{}/statuses", commit_sha))
            .await?
            .query(&[("per_page", STATUSES_PER_PAGE)]);
        let statuses: Vec<CommitStatus> = self.send(builder).await?;
        Ok(statuses
            .iter()
            .any(|status| status.context.as_deref() == Some(STATUS_CONTEXT)))
    }

    /// Set the `conbench` commit status. The title becomes the description.
    pub async fn update_commit_status(
        &self,
        commit_sha: &str,
        request: &PublishRequest,
    ) -> Result<PublishReceipt, PublishError> {
        let state = status_state(request.conclusion);
        let mut payload = json!({
            "state": state,
            "description": status_description(&request.title),
            "context": STATUS_CONTEXT,
        });
        if let Some(url) = &request.details_url {
            payload["target_url"] = json!(url);
        }

        let updated_existing = self.has_status(commit_sha).await?;
        let builder = self
            .request(reqwest::Method::POST, &format!("/statuses/{}", commit_sha))
            .await?
            .json(&payload);
        let status: CommitStatus = self.send(builder).await?;

        info!("Set {} status on {} to {}", STATUS_CONTEXT, commit_sha, state);
        Ok(PublishReceipt {
            id: status.id.to_string(),
            url: status.target_url,
            updated_existing,
        })
    }
}

#[async_trait]
impl ReportPublisher for GitHubRepoClient {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        match &request.target {
            PublishTarget::PullRequest(number) => self.upsert_comment(*number, request).await,
            PublishTarget::Commit(sha) => self.upsert_check_run(sha, request).await,
            PublishTarget::CommitStatus(sha) => self.update_commit_status(sha, request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(status: u16) -> ClientError {
        ClientError::Status {
            url: "https://api.github.com/repos/o/r".to_string(),
            status,
            body: "{}".to_string(),
        }
    }

    #[test]
    fn test_marker_is_stable_and_key_specific() {
        let a = comment_marker("abc@pull/1");
        assert_eq!(a, comment_marker("abc@pull/1"));
        assert_ne!(a, comment_marker("abc@pull/2"));
        assert!(a.starts_with("<!-- benchalerts:"));
        assert!(a.ends_with(" -->"));
        assert_eq!(a.len(), "<!-- benchalerts: -->".len() + MARKER_DIGEST_LEN);
    }

    #[test]
    fn test_status_mapping() {
        for status in [401, 403, 404, 422] {
            assert!(matches!(publish_error(status_error(status)), PublishError::Rejected(_)));
        }
        for status in [429, 500, 502, 503] {
            assert!(publish_error(status_error(status)).is_transient());
        }
        assert!(matches!(publish_error(status_error(400)), PublishError::Other(_)));
    }

    #[test]
    fn test_check_state() {
        assert_eq!(check_state(Conclusion::Pending), ("in_progress", None));
        assert_eq!(check_state(Conclusion::Failure), ("completed", Some("failure")));
        assert_eq!(check_state(Conclusion::Error), ("completed", Some("neutral")));
    }

    #[test]
    fn test_status_state() {
        assert_eq!(status_state(Conclusion::Pending), "pending");
        assert_eq!(status_state(Conclusion::Success), "success");
        assert_eq!(status_state(Conclusion::Neutral), "success");
        assert_eq!(status_state(Conclusion::Failure), "failure");
        assert_eq!(status_state(Conclusion::Error), "error");
    }

    #[test]
    fn test_status_description_is_capped() {
        assert_eq!(status_description("Found 2 regressions"), "Found 2 regressions");
        assert_eq!(status_description(&"x".repeat(300)).len(), MAX_STATUS_DESCRIPTION);
    }

    #[test]
    fn test_app_token_rejects_bad_key() {
        assert!(GitHubAppToken::new("123", "not a key").is_err());
        let pem = include_str!("../tests/fixtures/app_private_key.pem");
        assert!(GitHubAppToken::new("", pem).is_err());
    }

    #[test]
    fn test_app_jwt_claims() {
        let pem = include_str!("../tests/fixtures/app_private_key.pem");
        let app = GitHubAppToken::new("123", pem).unwrap();
        let jwt = app.app_jwt().unwrap();

        let key = jsonwebtoken::DecodingKey::from_rsa_pem(include_bytes!("../tests/fixtures/app_public_key.pem")).unwrap();
        let mut validation = jsonwebtoken::Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.set_issuer(&["123"]);
        let decoded = jsonwebtoken::decode::<serde_json::Value>(&jwt, &key, &validation).unwrap();

        let iat = decoded.claims["iat"].as_u64().unwrap();
        let exp = decoded.claims["exp"].as_u64().unwrap();
        assert_eq!(exp - iat, JWT_BACKDATE_SECS + JWT_LIFETIME_SECS);
        assert!(format!("{:?}", app).contains("app_id: \"123\""));
    }

    #[test]
    fn test_repo_must_have_owner() {
        let tokens: Arc<dyn TokenProvider> = Arc::new(StaticToken::new("t"));
        assert!(GitHubRepoClient::new("just-a-name", tokens.clone()).is_err());
        let client = GitHubRepoClient::new("apache/arrow", tokens).unwrap();
        assert_eq!(client.base_url, "https://api.github.com/repos/apache/arrow");
        let client = client.with_api_base("http://localhost:8080/");
        assert_eq!(client.base_url, "http://localhost:8080/repos/apache/arrow");
    }

    #[test]
    fn test_static_token_is_redacted() {
        assert_eq!(format!("{:?}", StaticToken::new("secret")), "StaticToken(***)");
    }
}
