//! Collaborator contracts: where comparisons come from and where reports go.
//!
//! Implementations live outside the core (`benchalerts-clients` for Conbench
//! and GitHub, [`crate::fakes`] for tests).

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::classify::Conclusion;
use crate::model::RunComparisonSet;

/// What to ask the benchmarking server for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Full contender commit SHA, exactly as the server stores it.
    pub contender_sha: String,

    /// Z-score threshold forwarded to the server's comparison; `None` uses its default.
    #[serde(default)]
    pub z_score_threshold: Option<f64>,
}

/// Comparison data for one contender commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchedComparisons {
    pub contender_sha: String,
    pub baseline_sha: String,
    pub sets: Vec<RunComparisonSet>,
}

/// Errors reported by a [`ComparisonSource`].
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The server has no comparable baseline for this commit.
    #[error("no baseline: {0}")]
    NoBaseline(String),

    /// Worth retrying (rate limits, gateway errors, dropped connections).
    #[error("transient source error: {0}")]
    Transient(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

/// Retrieves benchmark comparisons between a contender and its baseline.
#[async_trait]
pub trait ComparisonSource: Send + Sync {
    async fn fetch_comparisons(&self, request: &FetchRequest) -> Result<FetchedComparisons, SourceError>;
}

/// Where a report is posted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishTarget {
    /// A comment on this pull request.
    PullRequest(u64),
    /// A check on this commit.
    Commit(String),
    /// A commit status on this commit.
    CommitStatus(String),
}

impl fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishTarget::PullRequest(number) => write!(f, "pull/{}", number),
            PublishTarget::Commit(sha) => write!(f, "commit/{}", sha),
            PublishTarget::CommitStatus(sha) => write!(f, "status/{}", sha),
        }
    }
}

/// A rendered report ready for the posting collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Repeated publishes with the same key replace the earlier post.
    pub idempotency_key: String,
    pub target: PublishTarget,
    pub title: String,
    pub report: String,
    pub conclusion: Conclusion,
    #[serde(default)]
    pub details_url: Option<String>,
}

impl PublishRequest {
    /// Key derived from the contender SHA and the target.
    pub fn idempotency_key_for(contender_sha: &str, target: &PublishTarget) -> String {
        format!("{}@{}", contender_sha, target)
    }
}

/// Acknowledgement returned by the posting collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Platform identifier of the comment, check or status.
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Whether an existing post was replaced instead of a new one created.
    pub updated_existing: bool,
}

/// Errors reported by a [`ReportPublisher`].
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("transient publish error: {0}")]
    Transient(String),

    /// The platform refused the write (permissions, validation, missing target).
    #[error("publish rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }
}

/// Posts reports to the source-control host. Owns authentication.
#[async_trait]
pub trait ReportPublisher: Send + Sync {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_is_stable_per_target() {
        let pr = PublishTarget::PullRequest(1347);
        let commit = PublishTarget::Commit("abc".to_string());
        let status = PublishTarget::CommitStatus("abc".to_string());
        assert_eq!(PublishRequest::idempotency_key_for("abc", &pr), "abc@pull/1347");
        assert_eq!(PublishRequest::idempotency_key_for("abc", &commit), "abc@commit/abc");
        assert_eq!(PublishRequest::idempotency_key_for("abc", &status), "abc@status/abc");
        assert_eq!(
            PublishRequest::idempotency_key_for("abc", &pr),
            PublishRequest::idempotency_key_for("abc", &PublishTarget::PullRequest(1347))
        );
    }

    #[test]
    fn test_error_transience() {
        assert!(SourceError::Transient("503".into()).is_transient());
        assert!(!SourceError::NoBaseline("none".into()).is_transient());
        assert!(PublishError::Transient("429".into()).is_transient());
        assert!(!PublishError::Rejected("403".into()).is_transient());
    }

    #[test]
    fn test_publish_target_serde() {
        let json = serde_json::to_string(&PublishTarget::PullRequest(5)).unwrap();
        assert_eq!(json, r#"{"pull_request":5}"#);
        let json = serde_json::to_string(&PublishTarget::CommitStatus("abc".to_string())).unwrap();
        assert_eq!(json, r#"{"commit_status":"abc"}"#);
    }
}
