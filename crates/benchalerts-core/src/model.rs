//! Comparison records for one alert cycle.
//!
//! A cycle fetches one [`RunComparisonSet`] per contender run, classifies the
//! upstream verdicts and folds the regressed subset into an [`AlertSummary`].

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Delimiter used to join a benchmark's tags into its display signature.
pub const TAG_DELIMITER: &str = ", ";

/// One benchmark execution on the benchmarking server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Run {
    /// Contender run ID (the run being reported on).
    pub run_id: String,

    /// Commit the run was executed against.
    pub commit_sha: String,

    /// Baseline run this run is compared to.
    pub baseline_run_id: String,

    /// Contender run ID used in the comparison link.
    pub contender_run_id: String,
}

impl Run {
    pub fn new(
        run_id: impl Into<String>,
        commit_sha: impl Into<String>,
        baseline_run_id: impl Into<String>,
        contender_run_id: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            commit_sha: commit_sha.into(),
            baseline_run_id: baseline_run_id.into(),
            contender_run_id: contender_run_id.into(),
        }
    }

    /// Link to the run comparison page under `base`.
    pub fn compare_url(&self, base: &str) -> String {
        format!(
            "{}/{}...{}",
            base.trim_end_matches('/'),
            self.baseline_run_id,
            self.contender_run_id
        )
    }
}

/// Upstream regression verdict for one benchmark.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Regressed,
    Improved,
    Unchanged,
    Unknown,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Regressed => "regressed",
            Verdict::Improved => "improved",
            Verdict::Unchanged => "unchanged",
            Verdict::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One benchmark within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BenchmarkComparison {
    pub name: String,

    /// Display tags in upstream order (codec, dataset, format, language...).
    pub tags: Vec<String>,

    pub verdict: Verdict,

    /// Run this comparison was reported under, when the source includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl BenchmarkComparison {
    pub fn new(name: impl Into<String>, tags: Vec<String>, verdict: Verdict) -> Self {
        Self {
            name: name.into(),
            tags,
            verdict,
            run_id: None,
        }
    }

    /// Tag this comparison with the run it was reported under.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Tags joined with [`TAG_DELIMITER`], the identifier shown in reports.
    pub fn tag_signature(&self) -> String {
        self.tags.join(TAG_DELIMITER)
    }

    pub fn is_regressed(&self) -> bool {
        self.verdict == Verdict::Regressed
    }
}

/// A run plus its ordered benchmark comparisons.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunComparisonSet {
    run: Run,
    comparisons: Vec<BenchmarkComparison>,
}

impl RunComparisonSet {
    /// Build a set, rejecting comparisons that name a different run.
    pub fn new(run: Run, comparisons: Vec<BenchmarkComparison>) -> Result<Self, ModelError> {
        if let Some(foreign) = comparisons
            .iter()
            .find(|c| c.run_id.as_deref().is_some_and(|id| id != run.run_id))
        {
            return Err(ModelError::ForeignComparison {
                benchmark: foreign.name.clone(),
                expected_run: run.run_id.clone(),
                actual_run: foreign.run_id.clone().unwrap_or_default(),
            });
        }
        Ok(Self { run, comparisons })
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn comparisons(&self) -> &[BenchmarkComparison] {
        &self.comparisons
    }

    /// Regressed comparisons in input order.
    pub fn regressions(&self) -> impl Iterator<Item = &BenchmarkComparison> {
        self.comparisons.iter().filter(|c| c.is_regressed())
    }

    pub fn count(&self, verdict: Verdict) -> usize {
        self.comparisons.iter().filter(|c| c.verdict == verdict).count()
    }
}

/// Whether the baseline commit is the contender's immediate parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ancestry {
    pub baseline_is_parent: bool,
    pub baseline_sha: String,
    pub contender_sha: String,

    /// Set when the commit graph could not answer.
    #[serde(default)]
    pub unresolved: bool,
}

impl Ancestry {
    pub fn new(baseline_sha: &str, contender_sha: &str, baseline_is_parent: bool) -> Self {
        Self {
            baseline_is_parent,
            baseline_sha: baseline_sha.to_string(),
            contender_sha: contender_sha.to_string(),
            unresolved: false,
        }
    }

    /// Lookup failed; reported as not-parent so the caveat is shown.
    pub fn unknown(baseline_sha: &str, contender_sha: &str) -> Self {
        Self {
            unresolved: true,
            ..Self::new(baseline_sha, contender_sha, false)
        }
    }
}

/// A run together with its regressed benchmarks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegressedRun {
    pub run: Run,
    pub regressions: Vec<BenchmarkComparison>,
}

impl RegressedRun {
    /// Distinct tag signatures in first-seen order.
    pub fn distinct_signatures(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for benchmark in &self.regressions {
            let signature = benchmark.tag_signature();
            if !seen.contains(&signature) {
                seen.push(signature);
            }
        }
        seen
    }
}

/// Final artifact of one alert cycle, consumed by the renderer and publisher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertSummary {
    contender_sha: String,
    regression_count: usize,
    runs: Vec<RegressedRun>,
    baseline_is_parent: bool,
}

impl AlertSummary {
    /// Build a summary whose count is derived from `runs`.
    pub fn new(contender_sha: impl Into<String>, runs: Vec<RegressedRun>, ancestry: &Ancestry) -> Self {
        let regression_count = runs.iter().map(|r| r.regressions.len()).sum();
        Self {
            contender_sha: contender_sha.into(),
            regression_count,
            runs,
            baseline_is_parent: ancestry.baseline_is_parent,
        }
    }

    /// Assemble a summary from raw parts without checking the count.
    ///
    /// The renderer validates the result; this exists for summaries loaded
    /// from elsewhere (fixtures, other producers).
    pub fn from_parts(
        contender_sha: impl Into<String>,
        regression_count: usize,
        runs: Vec<RegressedRun>,
        baseline_is_parent: bool,
    ) -> Self {
        Self {
            contender_sha: contender_sha.into(),
            regression_count,
            runs,
            baseline_is_parent,
        }
    }

    pub fn contender_sha(&self) -> &str {
        &self.contender_sha
    }

    pub fn regression_count(&self) -> usize {
        self.regression_count
    }

    pub fn runs(&self) -> &[RegressedRun] {
        &self.runs
    }

    pub fn baseline_is_parent(&self) -> bool {
        self.baseline_is_parent
    }

    /// Check the summary's internal consistency.
    pub fn validate(&self) -> Result<(), ModelError> {
        for entry in &self.runs {
            if entry.regressions.is_empty() {
                return Err(ModelError::EmptyRegressedRun {
                    run_id: entry.run.run_id.clone(),
                });
            }
            if let Some(listed) = entry.regressions.iter().find(|b| !b.is_regressed()) {
                return Err(ModelError::NonRegressedListed {
                    run_id: entry.run.run_id.clone(),
                    benchmark: listed.name.clone(),
                    verdict: listed.verdict,
                });
            }
        }

        let listed: usize = self.runs.iter().map(|r| r.regressions.len()).sum();
        if listed != self.regression_count {
            return Err(ModelError::CountMismatch {
                declared: self.regression_count,
                listed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(raw: &str) -> Vec<String> {
        raw.split(TAG_DELIMITER).map(str::to_string).collect()
    }

    #[test]
    fn test_compare_url_joins_run_ids() {
        let run = Run::new("c1", "abc", "b1", "c1");
        assert_eq!(run.compare_url("https://conbench"), "https://conbench/b1...c1");
        assert_eq!(run.compare_url("https://conbench/"), "https://conbench/b1...c1");
    }

    #[test]
    fn test_tag_signature_preserves_order() {
        let b = BenchmarkComparison::new("file-read", tags("snappy, nyctaxi_sample, parquet, arrow"), Verdict::Regressed);
        assert_eq!(b.tag_signature(), "snappy, nyctaxi_sample, parquet, arrow");
    }

    #[test]
    fn test_verdict_serializes_snake_case() {
        let json = serde_json::to_string(&Verdict::Regressed).unwrap();
        assert_eq!(json, "\"regressed\"");
        let back: Verdict = serde_json::from_str("\"unknown\"").unwrap();
        assert_eq!(back, Verdict::Unknown);
    }

    #[test]
    fn test_set_rejects_foreign_comparison() {
        let run = Run::new("r1", "abc", "b1", "r1");
        let err = RunComparisonSet::new(
            run,
            vec![BenchmarkComparison::new("x", vec![], Verdict::Unchanged).with_run_id("r2")],
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::ForeignComparison { .. }));
    }

    #[test]
    fn test_set_accepts_matching_and_untagged_comparisons() {
        let run = Run::new("r1", "abc", "b1", "r1");
        let set = RunComparisonSet::new(
            run,
            vec![
                BenchmarkComparison::new("x", vec![], Verdict::Regressed).with_run_id("r1"),
                BenchmarkComparison::new("y", vec![], Verdict::Improved),
            ],
        )
        .unwrap();
        assert_eq!(set.count(Verdict::Regressed), 1);
        assert_eq!(set.regressions().count(), 1);
    }

    #[test]
    fn test_distinct_signatures_dedupes_in_order() {
        let entry = RegressedRun {
            run: Run::new("r1", "abc", "b1", "r1"),
            regressions: vec![
                BenchmarkComparison::new("a", tags("lz4, tpch"), Verdict::Regressed),
                BenchmarkComparison::new("b", tags("snappy, tpch"), Verdict::Regressed),
                BenchmarkComparison::new("c", tags("lz4, tpch"), Verdict::Regressed),
            ],
        };
        assert_eq!(entry.distinct_signatures(), vec!["lz4, tpch", "snappy, tpch"]);
    }

    #[test]
    fn test_validate_detects_count_mismatch() {
        let entry = RegressedRun {
            run: Run::new("r1", "abc", "b1", "r1"),
            regressions: vec![BenchmarkComparison::new("a", vec![], Verdict::Regressed)],
        };
        let summary = AlertSummary::from_parts("abc", 3, vec![entry], true);
        assert!(matches!(
            summary.validate(),
            Err(ModelError::CountMismatch { declared: 3, listed: 1 })
        ));
    }

    #[test]
    fn test_validate_detects_empty_run() {
        let entry = RegressedRun {
            run: Run::new("r1", "abc", "b1", "r1"),
            regressions: vec![],
        };
        let summary = AlertSummary::from_parts("abc", 0, vec![entry], true);
        assert!(matches!(summary.validate(), Err(ModelError::EmptyRegressedRun { .. })));
    }

    #[test]
    fn test_validate_rejects_non_regressed_benchmark() {
        let entry = RegressedRun {
            run: Run::new("r1", "abc", "b1", "r1"),
            regressions: vec![
                BenchmarkComparison::new("zstd", vec![], Verdict::Regressed),
                BenchmarkComparison::new("lz4", vec![], Verdict::Improved),
            ],
        };
        let summary = AlertSummary::from_parts("abc", 2, vec![entry], true);
        assert_eq!(
            summary.validate(),
            Err(ModelError::NonRegressedListed {
                run_id: "r1".to_string(),
                benchmark: "lz4".to_string(),
                verdict: Verdict::Improved,
            })
        );
    }

    #[test]
    fn test_unknown_ancestry_is_not_parent() {
        let ancestry = Ancestry::unknown("base", "head");
        assert!(!ancestry.baseline_is_parent);
        assert!(ancestry.unresolved);
    }
}
