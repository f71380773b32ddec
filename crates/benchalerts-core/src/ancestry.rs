//! Baseline ancestry policy.
//!
//! Conbench picks the baseline as the most recent ancestor with results,
//! which for pull requests is usually the branch point rather than the
//! direct parent. A non-parent baseline only earns a note in the report.

use std::sync::Arc;

use async_trait::async_trait;

use crate::model::Ancestry;
use crate::obs;

/// Commit-graph lookup provided by a git history backend.
#[async_trait]
pub trait CommitGraph: Send + Sync {
    /// Whether `candidate_parent` is the immediate parent of `commit`.
    async fn is_parent(&self, candidate_parent: &str, commit: &str) -> anyhow::Result<bool>;
}

/// Resolves [`Ancestry`] for a cycle. Never fails and never retries.
#[derive(Clone)]
pub struct AncestryChecker {
    graph: Arc<dyn CommitGraph>,
}

impl AncestryChecker {
    pub fn new(graph: Arc<dyn CommitGraph>) -> Self {
        Self { graph }
    }

    pub async fn check(&self, baseline_sha: &str, contender_sha: &str) -> Ancestry {
        match self.graph.is_parent(baseline_sha, contender_sha).await {
            Ok(is_parent) => {
                obs::emit_ancestry_resolved(baseline_sha, contender_sha, is_parent);
                Ancestry::new(baseline_sha, contender_sha, is_parent)
            }
            Err(err) => {
                obs::emit_ancestry_unresolved(baseline_sha, contender_sha, &err);
                Ancestry::unknown(baseline_sha, contender_sha)
            }
        }
    }
}
