//! Commit graph backed by a local git checkout.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::process::Command;

use benchalerts_core::CommitGraph;

/// Answers parent lookups with `git rev-parse` in `repo_dir`.
#[derive(Debug, Clone)]
pub struct GitCommitGraph {
    repo_dir: PathBuf,
}

impl GitCommitGraph {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Resolve a revision expression to a full commit SHA.
    pub async fn rev_parse(&self, revision: &str) -> anyhow::Result<String> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("{revision}^{{commit}}"))
            .current_dir(&self.repo_dir)
            .output()
            .await
            .context("failed to run git")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git rev-parse {revision} failed: {}", stderr.trim());
        }

        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if sha.is_empty() {
            bail!("git rev-parse {revision} returned empty output");
        }
        Ok(sha)
    }
}

#[async_trait]
impl CommitGraph for GitCommitGraph {
    async fn is_parent(&self, candidate_parent: &str, commit: &str) -> anyhow::Result<bool> {
        let parent = self.rev_parse(&format!("{commit}^")).await?;
        let candidate = self.rev_parse(candidate_parent).await?;
        Ok(parent == candidate)
    }
}
