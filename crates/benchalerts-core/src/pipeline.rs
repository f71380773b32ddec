//! Alert cycle orchestration.
//!
//! One cycle runs `Fetching → Classifying → Rendering → Publishing → Done`
//! strictly in sequence; any of the first four may end in `Failed`. Cycles for
//! different commits share nothing but the collaborators, so one pipeline can
//! serve many concurrent cycles.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::ancestry::{AncestryChecker, CommitGraph};
use crate::classify::{Conclusion, RegressionClassifier, RegressionPolicy};
use crate::config::AlertConfig;
use crate::error::{AlertError, FailureKind, PipelineFailure};
use crate::model::{AlertSummary, Ancestry};
use crate::obs;
use crate::render::ReportRenderer;
use crate::retry::{retry_with_backoff, RetryError};
use crate::sources::{
    ComparisonSource, FetchRequest, FetchedComparisons, PublishError, PublishReceipt, PublishRequest, PublishTarget,
    ReportPublisher, SourceError,
};

/// Title of the report posted while the analysis runs.
pub const PENDING_TITLE: &str = "Finding possible regressions";

/// Title of the report posted when the analysis fails.
pub const ERROR_TITLE: &str = "Error when finding regressions";

/// Pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Fetching,
    Classifying,
    Rendering,
    Publishing,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Fetching => "fetching",
            PipelineStage::Classifying => "classifying",
            PipelineStage::Rendering => "rendering",
            PipelineStage::Publishing => "publishing",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Failed)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One alert cycle to run.
#[derive(Debug, Clone)]
pub struct AlertRequest {
    pub contender_sha: String,
    pub target: PublishTarget,

    /// Fetching and Publishing abort with `Timeout` once this passes.
    pub deadline: Option<Instant>,

    /// Linked from a successful report (e.g. the server's runs for this commit).
    pub details_url: Option<String>,

    /// Linked from pending and error reports (e.g. the CI build).
    pub build_url: Option<String>,
}

impl AlertRequest {
    pub fn new(contender_sha: impl Into<String>, target: PublishTarget) -> Self {
        Self {
            contender_sha: contender_sha.into(),
            target,
            deadline: None,
            details_url: None,
            build_url: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_details_url(mut self, url: impl Into<String>) -> Self {
        self.details_url = Some(url.into());
        self
    }

    pub fn with_build_url(mut self, url: impl Into<String>) -> Self {
        self.build_url = Some(url.into());
        self
    }

    fn idempotency_key(&self) -> String {
        PublishRequest::idempotency_key_for(&self.contender_sha, &self.target)
    }
}

/// Result of a completed cycle.
#[derive(Debug, Clone)]
pub struct AlertOutcome {
    pub cycle_id: Uuid,
    pub summary: AlertSummary,
    pub ancestry: Ancestry,
    pub conclusion: Conclusion,
    pub report: String,
    pub receipt: PublishReceipt,

    /// Every stage entered, ending in `Done`.
    pub stages: Vec<PipelineStage>,
}

/// Tracks stage transitions for one cycle.
struct StageTracker {
    contender_sha: String,
    started: StdInstant,
    history: Vec<PipelineStage>,
}

impl StageTracker {
    fn new(contender_sha: &str) -> Self {
        Self {
            contender_sha: contender_sha.to_string(),
            started: StdInstant::now(),
            history: Vec::new(),
        }
    }

    fn enter(&mut self, stage: PipelineStage) {
        obs::emit_stage_entered(&self.contender_sha, stage);
        self.history.push(stage);
    }

    fn current(&self) -> PipelineStage {
        self.history.last().copied().unwrap_or(PipelineStage::Fetching)
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn fail(&mut self, error: AlertError) -> PipelineFailure {
        let stage = self.current();
        self.enter(PipelineStage::Failed);
        let failure = PipelineFailure {
            contender_sha: self.contender_sha.clone(),
            stage,
            error,
        };
        obs::emit_cycle_failed(&failure);
        failure
    }
}

/// Run `fut` until the optional deadline; `None` means the deadline passed.
async fn until_deadline<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Fetch → classify → render → publish for one contender commit.
#[derive(Clone)]
pub struct AlertPipeline {
    source: Arc<dyn ComparisonSource>,
    publisher: Arc<dyn ReportPublisher>,
    ancestry: AncestryChecker,
    classifier: Arc<RegressionClassifier>,
    renderer: ReportRenderer,
    config: AlertConfig,
}

impl AlertPipeline {
    pub fn new(
        source: Arc<dyn ComparisonSource>,
        graph: Arc<dyn CommitGraph>,
        publisher: Arc<dyn ReportPublisher>,
        config: AlertConfig,
    ) -> Self {
        let renderer = ReportRenderer::new(config.compare_base_url.clone())
            .with_baseline_warning(config.warn_if_baseline_isnt_parent);
        Self {
            source,
            publisher,
            ancestry: AncestryChecker::new(graph),
            classifier: Arc::new(RegressionClassifier::default()),
            renderer,
            config,
        }
    }

    /// Replace the default upstream-verdict policy.
    pub fn with_policy(mut self, policy: impl RegressionPolicy + 'static) -> Self {
        self.classifier = Arc::new(RegressionClassifier::new(policy));
        self
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    pub fn renderer(&self) -> &ReportRenderer {
        &self.renderer
    }

    /// Run one cycle and publish its report.
    pub async fn run(&self, request: &AlertRequest) -> Result<AlertOutcome, PipelineFailure> {
        let cycle_id = Uuid::new_v4();
        self.run_cycle(cycle_id, request)
            .instrument(obs::cycle_span(cycle_id, &request.contender_sha))
            .await
    }

    /// Like [`run`](Self::run), but first posts a pending report and, if the
    /// cycle fails after that, makes a best-effort attempt to post an error
    /// report linking the build. The original failure is always returned.
    pub async fn run_with_status(&self, request: &AlertRequest) -> Result<AlertOutcome, PipelineFailure> {
        let cycle_id = Uuid::new_v4();
        let span = obs::cycle_span(cycle_id, &request.contender_sha);

        async {
            let mut tracker = StageTracker::new(&request.contender_sha);
            let pending = PublishRequest {
                idempotency_key: request.idempotency_key(),
                target: request.target.clone(),
                title: PENDING_TITLE.to_string(),
                report: self.renderer.render_pending(&request.contender_sha),
                conclusion: Conclusion::Pending,
                details_url: request.build_url.clone(),
            };
            tracker.enter(PipelineStage::Publishing);
            if let Err(err) = self.publish(&pending, request.deadline, &tracker).await {
                return Err(tracker.fail(err));
            }

            match self.run_cycle(cycle_id, request).await {
                Ok(outcome) => Ok(outcome),
                Err(failure) => {
                    if failure.kind() != FailureKind::PublishFailure {
                        self.publish_error_report(request, &failure).await;
                    }
                    Err(failure)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn publish_error_report(&self, request: &AlertRequest, failure: &PipelineFailure) {
        let report = PublishRequest {
            idempotency_key: request.idempotency_key(),
            target: request.target.clone(),
            title: ERROR_TITLE.to_string(),
            report: self.renderer.render_error(failure),
            conclusion: Conclusion::Error,
            details_url: request.build_url.clone(),
        };
        // No deadline: the caller's budget is already spent or the cycle failed early.
        match self.publisher.publish(&report).await {
            Ok(receipt) => {
                obs::emit_published(&report.idempotency_key, &receipt.id, receipt.updated_existing)
            }
            Err(err) => tracing::warn!(
                event = "cycle.error_report_failed",
                contender_sha = %request.contender_sha,
                error = %err,
            ),
        }
    }

    async fn run_cycle(&self, cycle_id: Uuid, request: &AlertRequest) -> Result<AlertOutcome, PipelineFailure> {
        let sha = request.contender_sha.as_str();
        let mut tracker = StageTracker::new(sha);

        // Fetching
        tracker.enter(PipelineStage::Fetching);
        let fetch_request = FetchRequest {
            contender_sha: sha.to_string(),
            z_score_threshold: self.config.z_score_threshold,
        };
        let fetched = match self.fetch(&fetch_request, request.deadline, &tracker).await {
            Ok(fetched) => fetched,
            Err(err) => return Err(tracker.fail(err)),
        };

        let ancestry = match until_deadline(
            request.deadline,
            self.ancestry.check(&fetched.baseline_sha, sha),
        )
        .await
        {
            Some(ancestry) => ancestry,
            None => Ancestry::unknown(&fetched.baseline_sha, sha),
        };

        // Classifying
        tracker.enter(PipelineStage::Classifying);
        let classification = self.classifier.classify(fetched.sets);
        obs::emit_classified(sha, classification.benchmark_count(), classification.regression_count());
        let conclusion = classification.check_conclusion();
        let summary = classification.into_summary(sha, &ancestry);

        // Rendering
        tracker.enter(PipelineStage::Rendering);
        let report = match self.renderer.render(&summary) {
            Ok(report) => report,
            Err(err) => return Err(tracker.fail(err.into())),
        };

        // Publishing
        tracker.enter(PipelineStage::Publishing);
        let publish_request = PublishRequest {
            idempotency_key: request.idempotency_key(),
            target: request.target.clone(),
            title: self.renderer.render_title(&summary),
            report: report.clone(),
            conclusion,
            details_url: request.details_url.clone(),
        };
        let receipt = match self.publish(&publish_request, request.deadline, &tracker).await {
            Ok(receipt) => receipt,
            Err(err) => return Err(tracker.fail(err)),
        };

        tracker.enter(PipelineStage::Done);
        Ok(AlertOutcome {
            cycle_id,
            summary,
            ancestry,
            conclusion,
            report,
            receipt,
            stages: tracker.history,
        })
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        deadline: Option<Instant>,
        tracker: &StageTracker,
    ) -> Result<FetchedComparisons, AlertError> {
        let attempt = retry_with_backoff(
            &self.config.fetch_retry,
            "fetch_comparisons",
            SourceError::is_transient,
            || self.source.fetch_comparisons(request),
        );

        let result = until_deadline(deadline, attempt).await.ok_or_else(|| AlertError::Timeout {
            stage: PipelineStage::Fetching,
            elapsed_ms: tracker.elapsed_ms(),
        })?;

        match result {
            Ok((fetched, attempts)) => {
                obs::emit_comparisons_fetched(
                    &request.contender_sha,
                    &fetched.baseline_sha,
                    fetched.sets.len(),
                    attempts,
                );
                Ok(fetched)
            }
            Err(RetryError::Fatal {
                error: SourceError::NoBaseline(reason),
                ..
            }) => Err(AlertError::NoBaseline {
                contender_sha: request.contender_sha.clone(),
                reason,
            }),
            Err(RetryError::Fatal { attempts, error }) => Err(AlertError::FetchFailure {
                attempts,
                cause: anyhow::Error::new(error),
            }),
            Err(RetryError::Exhausted { attempts, last }) => Err(AlertError::FetchFailure {
                attempts,
                cause: anyhow::Error::new(last),
            }),
            Err(RetryError::TimedOut { .. }) => Err(AlertError::Timeout {
                stage: PipelineStage::Fetching,
                elapsed_ms: tracker.elapsed_ms(),
            }),
        }
    }

    async fn publish(
        &self,
        request: &PublishRequest,
        deadline: Option<Instant>,
        tracker: &StageTracker,
    ) -> Result<PublishReceipt, AlertError> {
        let attempt = retry_with_backoff(
            &self.config.publish_retry,
            "publish_report",
            PublishError::is_transient,
            || self.publisher.publish(request),
        );

        let result = until_deadline(deadline, attempt).await.ok_or_else(|| AlertError::Timeout {
            stage: PipelineStage::Publishing,
            elapsed_ms: tracker.elapsed_ms(),
        })?;

        match result {
            Ok((receipt, _)) => {
                obs::emit_published(&request.idempotency_key, &receipt.id, receipt.updated_existing);
                Ok(receipt)
            }
            Err(RetryError::Fatal { error, .. }) => Err(AlertError::PublishFailure {
                cause: anyhow::Error::new(error),
            }),
            Err(RetryError::Exhausted { last, .. }) => Err(AlertError::PublishFailure {
                cause: anyhow::Error::new(last),
            }),
            Err(RetryError::TimedOut { .. }) => Err(AlertError::Timeout {
                stage: PipelineStage::Publishing,
                elapsed_ms: tracker.elapsed_ms(),
            }),
        }
    }
}
