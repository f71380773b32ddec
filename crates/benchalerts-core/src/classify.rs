//! Regression classification over upstream verdicts.
//!
//! The benchmarking server decides per benchmark whether it regressed; this
//! module only aggregates those verdicts per run and in total.

use serde::{Deserialize, Serialize};

use crate::model::{AlertSummary, Ancestry, BenchmarkComparison, RegressedRun, RunComparisonSet, Verdict};

/// Decides whether a compared benchmark counts as a regression.
///
/// Benchmarks the policy flags are listed in the summary as `Regressed`,
/// whatever the upstream verdict was.
pub trait RegressionPolicy: Send + Sync {
    fn is_regression(&self, comparison: &BenchmarkComparison) -> bool;
}

/// Trusts the verdict attached by the benchmarking server.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpstreamVerdict;

impl RegressionPolicy for UpstreamVerdict {
    fn is_regression(&self, comparison: &BenchmarkComparison) -> bool {
        comparison.verdict == Verdict::Regressed
    }
}

/// Overall outcome reported alongside the rendered text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    /// Analysis is still running.
    Pending,
    /// No regressions.
    Success,
    /// At least one regression.
    Failure,
    /// Nothing to compare against.
    Neutral,
    /// The analysis itself broke.
    Error,
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Pending => "pending",
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::Neutral => "neutral",
            Conclusion::Error => "error",
        }
    }
}

/// Every fetched set plus the regressed view derived from them.
#[derive(Debug, Clone)]
pub struct Classification {
    sets: Vec<RunComparisonSet>,
    regressed: Vec<RegressedRun>,
}

impl Classification {
    /// All sets, including runs without regressions.
    pub fn sets(&self) -> &[RunComparisonSet] {
        &self.sets
    }

    /// Runs with at least one regression, in input order.
    pub fn regressed_runs(&self) -> &[RegressedRun] {
        &self.regressed
    }

    /// Total regressed benchmarks across all runs.
    pub fn regression_count(&self) -> usize {
        self.regressed.iter().map(|r| r.regressions.len()).sum()
    }

    pub fn count(&self, verdict: Verdict) -> usize {
        self.sets.iter().map(|s| s.count(verdict)).sum()
    }

    pub fn benchmark_count(&self) -> usize {
        self.sets.iter().map(|s| s.comparisons().len()).sum()
    }

    pub fn run_count(&self) -> usize {
        self.sets.len()
    }

    pub fn check_conclusion(&self) -> Conclusion {
        if self.sets.is_empty() {
            Conclusion::Neutral
        } else if self.regression_count() > 0 {
            Conclusion::Failure
        } else {
            Conclusion::Success
        }
    }

    /// Fold the regressed view into the cycle's summary.
    pub fn into_summary(self, contender_sha: &str, ancestry: &Ancestry) -> AlertSummary {
        AlertSummary::new(contender_sha, self.regressed, ancestry)
    }
}

/// Partitions comparison sets by verdict.
pub struct RegressionClassifier {
    policy: Box<dyn RegressionPolicy>,
}

impl Default for RegressionClassifier {
    fn default() -> Self {
        Self::new(UpstreamVerdict)
    }
}

impl RegressionClassifier {
    pub fn new(policy: impl RegressionPolicy + 'static) -> Self {
        Self {
            policy: Box::new(policy),
        }
    }

    /// Classify sets, keeping run and benchmark order stable.
    pub fn classify(&self, sets: Vec<RunComparisonSet>) -> Classification {
        let regressed = sets
            .iter()
            .filter_map(|set| {
                let regressions: Vec<BenchmarkComparison> = set
                    .comparisons()
                    .iter()
                    .filter(|c| self.policy.is_regression(c))
                    .map(|c| BenchmarkComparison {
                        verdict: Verdict::Regressed,
                        ..c.clone()
                    })
                    .collect();
                if regressions.is_empty() {
                    None
                } else {
                    Some(RegressedRun {
                        run: set.run().clone(),
                        regressions,
                    })
                }
            })
            .collect();

        Classification { sets, regressed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Run;

    fn set(run_id: &str, verdicts: &[(&str, Verdict)]) -> RunComparisonSet {
        RunComparisonSet::new(
            Run::new(run_id, "abc", format!("base-{run_id}"), run_id),
            verdicts
                .iter()
                .map(|(name, v)| BenchmarkComparison::new(*name, vec![name.to_string()], *v))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_input_is_neutral() {
        let classification = RegressionClassifier::default().classify(vec![]);
        assert_eq!(classification.regression_count(), 0);
        assert_eq!(classification.check_conclusion(), Conclusion::Neutral);
    }

    #[test]
    fn test_runs_without_regressions_leave_regressed_view() {
        let classification = RegressionClassifier::default().classify(vec![
            set("r1", &[("a", Verdict::Unchanged), ("b", Verdict::Improved)]),
            set("r2", &[("c", Verdict::Regressed)]),
        ]);

        assert_eq!(classification.run_count(), 2);
        assert_eq!(classification.regressed_runs().len(), 1);
        assert_eq!(classification.regressed_runs()[0].run.run_id, "r2");
        assert_eq!(classification.count(Verdict::Improved), 1);
        assert_eq!(classification.count(Verdict::Unchanged), 1);
        assert_eq!(classification.check_conclusion(), Conclusion::Failure);
    }

    #[test]
    fn test_order_is_stable() {
        let classification = RegressionClassifier::default().classify(vec![
            set("r2", &[("z", Verdict::Regressed), ("a", Verdict::Regressed)]),
            set("r1", &[("m", Verdict::Regressed)]),
        ]);

        let runs: Vec<&str> = classification
            .regressed_runs()
            .iter()
            .map(|r| r.run.run_id.as_str())
            .collect();
        assert_eq!(runs, vec!["r2", "r1"]);

        let names: Vec<&str> = classification.regressed_runs()[0]
            .regressions
            .iter()
            .map(|b| b.name.as_str())
            .collect();
        assert_eq!(names, vec!["z", "a"]);
        assert_eq!(classification.regression_count(), 3);
    }

    #[test]
    fn test_unknown_verdicts_are_not_regressions() {
        let classification =
            RegressionClassifier::default().classify(vec![set("r1", &[("a", Verdict::Unknown)])]);
        assert_eq!(classification.regression_count(), 0);
        assert_eq!(classification.count(Verdict::Unknown), 1);
        assert_eq!(classification.check_conclusion(), Conclusion::Success);
    }

    #[test]
    fn test_custom_policy_is_honoured() {
        struct UnknownCounts;
        impl RegressionPolicy for UnknownCounts {
            fn is_regression(&self, c: &BenchmarkComparison) -> bool {
                matches!(c.verdict, Verdict::Regressed | Verdict::Unknown)
            }
        }

        let classification = RegressionClassifier::new(UnknownCounts)
            .classify(vec![set("r1", &[("a", Verdict::Unknown), ("b", Verdict::Unchanged)])]);
        assert_eq!(classification.regression_count(), 1);
        assert_eq!(classification.count(Verdict::Unknown), 1);
        assert_eq!(classification.regressed_runs()[0].regressions[0].verdict, Verdict::Regressed);

        let summary = classification.into_summary("abc", &Ancestry::new("base", "abc", true));
        assert!(summary.validate().is_ok());
    }

    #[test]
    fn test_into_summary_carries_count_and_ancestry() {
        let classification = RegressionClassifier::default().classify(vec![
            set("r1", &[("a", Verdict::Regressed)]),
            set("r2", &[("b", Verdict::Regressed), ("c", Verdict::Regressed)]),
        ]);
        let summary = classification.into_summary("abc", &Ancestry::new("base", "abc", false));
        assert_eq!(summary.regression_count(), 3);
        assert!(!summary.baseline_is_parent());
        assert!(summary.validate().is_ok());
    }
}
