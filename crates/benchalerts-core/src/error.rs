//! Error taxonomy for benchalerts.

use std::fmt;

use crate::model::Verdict;
use crate::pipeline::PipelineStage;

/// Errors raised while assembling or checking comparison records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("benchmark {benchmark} belongs to run {actual_run}, not {expected_run}")]
    ForeignComparison {
        benchmark: String,
        expected_run: String,
        actual_run: String,
    },

    #[error("run {run_id} is listed with zero regressed benchmarks")]
    EmptyRegressedRun { run_id: String },

    #[error("run {run_id} lists benchmark {benchmark} with verdict {verdict}")]
    NonRegressedListed {
        run_id: String,
        benchmark: String,
        verdict: Verdict,
    },

    #[error("summary declares {declared} regression(s) but lists {listed}")]
    CountMismatch { declared: usize, listed: usize },
}

/// Errors produced by the report renderer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("malformed summary: {0}")]
    MalformedSummary(#[from] ModelError),
}

/// Errors that end an alert cycle.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("no baseline found for contender {contender_sha}: {reason}")]
    NoBaseline { contender_sha: String, reason: String },

    #[error("{stage} exceeded its deadline after {elapsed_ms}ms")]
    Timeout { stage: PipelineStage, elapsed_ms: u64 },

    #[error(transparent)]
    MalformedSummary(#[from] RenderError),

    #[error("publishing the report failed: {cause}")]
    PublishFailure {
        #[source]
        cause: anyhow::Error,
    },

    #[error("fetching comparisons failed after {attempts} attempt(s): {cause}")]
    FetchFailure {
        attempts: u32,
        #[source]
        cause: anyhow::Error,
    },
}

impl AlertError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AlertError::NoBaseline { .. } => FailureKind::NoBaseline,
            AlertError::Timeout { .. } => FailureKind::Timeout,
            AlertError::MalformedSummary(_) => FailureKind::MalformedSummary,
            AlertError::PublishFailure { .. } => FailureKind::PublishFailure,
            AlertError::FetchFailure { .. } => FailureKind::FetchFailure,
        }
    }
}

/// Coarse failure category reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    NoBaseline,
    Timeout,
    MalformedSummary,
    PublishFailure,
    FetchFailure,
}

impl FailureKind {
    /// Whether a caller may reasonably retry the whole cycle later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Timeout | FailureKind::FetchFailure)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::NoBaseline => "no_baseline",
            FailureKind::Timeout => "timeout",
            FailureKind::MalformedSummary => "malformed_summary",
            FailureKind::PublishFailure => "publish_failure",
            FailureKind::FetchFailure => "fetch_failure",
        };
        f.write_str(name)
    }
}

/// Structured failure of one alert cycle: which commit, which stage, why.
#[derive(Debug, thiserror::Error)]
#[error("alert cycle for {contender_sha} failed during {stage}: {error}")]
pub struct PipelineFailure {
    pub contender_sha: String,
    pub stage: PipelineStage,
    #[source]
    pub error: AlertError,
}

impl PipelineFailure {
    pub fn kind(&self) -> FailureKind {
        self.error.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_malformed_summary_display() {
        let err = RenderError::from(ModelError::CountMismatch {
            declared: 2,
            listed: 1,
        });
        let msg = err.to_string();
        assert!(msg.contains("malformed summary"));
        assert!(msg.contains("declares 2"));
    }

    #[test]
    fn test_failure_kind_mapping() {
        let err = AlertError::NoBaseline {
            contender_sha: "abc".to_string(),
            reason: "no parent".to_string(),
        };
        assert_eq!(err.kind(), FailureKind::NoBaseline);
        assert!(!err.kind().is_retryable());

        let err = AlertError::Timeout {
            stage: PipelineStage::Fetching,
            elapsed_ms: 10,
        };
        assert_eq!(err.kind(), FailureKind::Timeout);
        assert!(err.kind().is_retryable());
    }

    #[test]
    fn test_publish_failure_keeps_cause() {
        let failure = PipelineFailure {
            contender_sha: "abc".to_string(),
            stage: PipelineStage::Publishing,
            error: AlertError::PublishFailure {
                cause: anyhow::anyhow!("403 resource not accessible"),
            },
        };
        assert_eq!(failure.kind(), FailureKind::PublishFailure);
        let source = failure.source().expect("alert error source");
        let cause = source.source().expect("publish cause");
        assert!(cause.to_string().contains("403"));
        assert!(failure.to_string().contains("publishing"));
    }
}
