//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides `MemoryComparisonSource`, `MemoryCommitGraph` and
//! `MemoryPublisher` that satisfy the trait contracts without any network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::ancestry::CommitGraph;
use crate::model::RunComparisonSet;
use crate::sources::{
    ComparisonSource, FetchRequest, FetchedComparisons, PublishError, PublishReceipt,
    PublishRequest, ReportPublisher, SourceError,
};

// ---------------------------------------------------------------------------
// MemoryComparisonSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CommitEntry {
    baseline_sha: String,
    sets: Vec<RunComparisonSet>,
}

/// Comparison source backed by a `HashMap<contender_sha, entry>`.
///
/// Unknown SHAs answer `NoBaseline`. Transient failures and latency can be
/// injected to exercise retry and deadline handling.
#[derive(Debug, Default)]
pub struct MemoryComparisonSource {
    commits: Mutex<HashMap<String, CommitEntry>>,
    transient_failures: AtomicU32,
    latency: Mutex<Option<Duration>>,
    calls: AtomicU32,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MemoryComparisonSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register comparisons for a contender commit.
    pub fn with_commit(self, contender_sha: &str, baseline_sha: &str, sets: Vec<RunComparisonSet>) -> Self {
        self.commits.lock().unwrap().insert(
            contender_sha.to_string(),
            CommitEntry {
                baseline_sha: baseline_sha.to_string(),
                sets,
            },
        );
        self
    }

    /// Fail the next `count` calls with a transient error.
    pub fn failing_transiently(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Sleep before answering each call.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap() = Some(latency);
        self
    }

    /// Number of fetch calls received.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received, in order.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComparisonSource for MemoryComparisonSource {
    async fn fetch_comparisons(&self, request: &FetchRequest) -> Result<FetchedComparisons, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SourceError::Transient("503 Service Unavailable".to_string()));
        }

        let commits = self.commits.lock().unwrap();
        let entry = commits.get(&request.contender_sha).ok_or_else(|| {
            SourceError::NoBaseline(format!(
                "contender commit '{}' has no baseline commit",
                request.contender_sha
            ))
        })?;

        Ok(FetchedComparisons {
            contender_sha: request.contender_sha.clone(),
            baseline_sha: entry.baseline_sha.clone(),
            sets: entry.sets.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryCommitGraph
// ---------------------------------------------------------------------------

/// Commit graph backed by a `HashMap<commit, parent>`; unknown commits error.
#[derive(Debug, Default)]
pub struct MemoryCommitGraph {
    parents: HashMap<String, String>,
}

impl MemoryCommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent(mut self, commit: &str, parent: &str) -> Self {
        self.parents.insert(commit.to_string(), parent.to_string());
        self
    }
}

#[async_trait]
impl CommitGraph for MemoryCommitGraph {
    async fn is_parent(&self, candidate_parent: &str, commit: &str) -> anyhow::Result<bool> {
        let parent = self
            .parents
            .get(commit)
            .ok_or_else(|| anyhow::anyhow!("commit {} not found", commit))?;
        Ok(parent == candidate_parent)
    }
}

// ---------------------------------------------------------------------------
// MemoryPublisher
// ---------------------------------------------------------------------------

/// Publisher that keeps the latest post per idempotency key.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    posts: Mutex<Vec<(String, PublishRequest)>>,
    history: Mutex<Vec<PublishRequest>>,
    rejection: Mutex<Option<String>>,
    transient_failures: AtomicU32,
    latency: Mutex<Option<Duration>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every publish with this reason.
    pub fn rejecting(self, reason: &str) -> Self {
        *self.rejection.lock().unwrap() = Some(reason.to_string());
        self
    }

    /// Fail the next `count` publishes with a transient error.
    pub fn failing_transiently(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap() = Some(latency);
        self
    }

    /// Current post per idempotency key, in first-publish order.
    pub fn posts(&self) -> Vec<PublishRequest> {
        self.posts.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    /// Every accepted publish, including ones that replaced earlier posts.
    pub fn history(&self) -> Vec<PublishRequest> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportPublisher for MemoryPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(reason) = self.rejection.lock().unwrap().clone() {
            return Err(PublishError::Rejected(reason));
        }

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PublishError::Transient("502 Bad Gateway".to_string()));
        }

        self.history.lock().unwrap().push(request.clone());

        let mut posts = self.posts.lock().unwrap();
        let existing = posts
            .iter()
            .position(|(key, _)| key == &request.idempotency_key);
        let (index, updated_existing) = match existing {
            Some(index) => {
                posts[index].1 = request.clone();
                (index, true)
            }
            None => {
                posts.push((request.idempotency_key.clone(), request.clone()));
                (posts.len() - 1, false)
            }
        };

        Ok(PublishReceipt {
            id: format!("post-{}", index + 1),
            url: None,
            updated_existing,
        })
    }
}
