//! benchalerts core - benchmark regression alerts
//!
//! Provides the alerting core that:
//! - Aggregates upstream regression verdicts per run
//! - Checks whether the baseline commit is the contender's parent
//! - Renders a deterministic Markdown report
//! - Orchestrates fetch, classify, render and publish with bounded retry

pub mod ancestry;
pub mod classify;
pub mod config;
pub mod error;
pub mod fakes;
pub mod model;
pub mod obs;
pub mod pipeline;
pub mod render;
pub mod retry;
pub mod sources;
pub mod telemetry;

// Re-export key types
pub use ancestry::{AncestryChecker, CommitGraph};
pub use classify::{Classification, Conclusion, RegressionClassifier, RegressionPolicy, UpstreamVerdict};
pub use config::AlertConfig;
pub use error::{AlertError, FailureKind, ModelError, PipelineFailure, RenderError};
pub use model::{AlertSummary, Ancestry, BenchmarkComparison, RegressedRun, Run, RunComparisonSet, Verdict};
pub use pipeline::{AlertOutcome, AlertPipeline, AlertRequest, PipelineStage};
pub use render::{ReportRenderer, BASELINE_NOT_PARENT_NOTE};
pub use retry::RetryConfig;
pub use sources::{
    ComparisonSource, FetchRequest, FetchedComparisons, PublishError, PublishReceipt,
    PublishRequest, PublishTarget, ReportPublisher, SourceError,
};
