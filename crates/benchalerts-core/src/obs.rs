//! Structured observability hooks for alert cycle events.
//!
//! This module provides:
//! - Cycle-scoped tracing spans via [`cycle_span`], attached with `Instrument`
//! - Emission functions for stage transitions, fetch, ancestry, publish and failure
//!
//! Events are emitted at `info!` level unless noted (configurable via `RUST_LOG`).

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PipelineFailure;
use crate::pipeline::PipelineStage;

/// Span tagging every event of one alert cycle.
///
/// # Example
///
/// ```ignore
/// some_future.instrument(cycle_span(cycle_id, "abc123")).await
/// // all tracing calls inside now carry cycle_id and contender_sha
/// ```
pub fn cycle_span(cycle_id: Uuid, contender_sha: &str) -> tracing::Span {
    tracing::info_span!("benchalerts.cycle", cycle_id = %cycle_id, contender_sha = %contender_sha)
}

/// Emit event: pipeline entered a new stage.
pub fn emit_stage_entered(contender_sha: &str, stage: PipelineStage) {
    info!(event = "cycle.stage", contender_sha = %contender_sha, stage = %stage);
}

/// Emit event: comparisons fetched.
pub fn emit_comparisons_fetched(contender_sha: &str, baseline_sha: &str, runs: usize, attempts: u32) {
    info!(
        event = "cycle.fetched",
        contender_sha = %contender_sha,
        baseline_sha = %baseline_sha,
        runs = runs,
        attempts = attempts,
    );
}

/// Emit event: verdicts aggregated.
pub fn emit_classified(contender_sha: &str, benchmarks: usize, regressions: usize) {
    info!(
        event = "cycle.classified",
        contender_sha = %contender_sha,
        benchmarks = benchmarks,
        regressions = regressions,
    );
}

/// Emit event: ancestry answered by the commit graph.
pub fn emit_ancestry_resolved(baseline_sha: &str, contender_sha: &str, baseline_is_parent: bool) {
    info!(
        event = "ancestry.resolved",
        baseline_sha = %baseline_sha,
        contender_sha = %contender_sha,
        baseline_is_parent = baseline_is_parent,
    );
}

/// Emit event: ancestry lookup failed (warning level).
pub fn emit_ancestry_unresolved(baseline_sha: &str, contender_sha: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "ancestry.unresolved",
        baseline_sha = %baseline_sha,
        contender_sha = %contender_sha,
        error = %error,
    );
}

/// Emit event: report published.
pub fn emit_published(idempotency_key: &str, receipt_id: &str, updated_existing: bool) {
    info!(
        event = "cycle.published",
        idempotency_key = %idempotency_key,
        receipt_id = %receipt_id,
        updated_existing = updated_existing,
    );
}

/// Emit event: cycle failed (warning level).
pub fn emit_cycle_failed(failure: &PipelineFailure) {
    warn!(
        event = "cycle.failed",
        contender_sha = %failure.contender_sha,
        stage = %failure.stage,
        kind = %failure.kind(),
        error = %failure.error,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_span_create() {
        let _span = cycle_span(Uuid::new_v4(), "abc").entered();
        emit_stage_entered("abc", PipelineStage::Fetching);
    }
}
