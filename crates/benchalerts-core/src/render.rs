//! Markdown report rendering.
//!
//! Bots reading pull request threads match on this layout, so the output is
//! byte-stable for a given [`AlertSummary`]: no clocks, no map iteration.

use std::fmt::Write as _;

use crate::error::RenderError;
use crate::model::AlertSummary;

/// Caveat appended when the baseline is not the contender's direct parent.
pub const BASELINE_NOT_PARENT_NOTE: &str = "The baseline commit is not the immediate parent of the contender commit. \
For pull requests this is expected: the baseline is the most recent commit on the target branch \
with benchmark results, usually the point the branch was created from. \
Some of the changes measured here may come from other commits.";

/// Number of leading SHA characters shown in short titles.
const SHORT_SHA_LEN: usize = 8;

/// Renders alert summaries into Markdown.
#[derive(Debug, Clone)]
pub struct ReportRenderer {
    compare_base_url: String,
    warn_if_baseline_isnt_parent: bool,
}

impl ReportRenderer {
    /// `compare_base_url` prefixes every run comparison link.
    pub fn new(compare_base_url: impl Into<String>) -> Self {
        Self {
            compare_base_url: compare_base_url.into(),
            warn_if_baseline_isnt_parent: true,
        }
    }

    /// Suppress the non-parent note, e.g. for noisy pull request workflows.
    pub fn with_baseline_warning(mut self, enabled: bool) -> Self {
        self.warn_if_baseline_isnt_parent = enabled;
        self
    }

    /// Render the full report.
    pub fn render(&self, summary: &AlertSummary) -> Result<String, RenderError> {
        summary.validate()?;

        let count = summary.regression_count();
        let mut md = format!(
            "Contender commit `{}` had {} {} compared to its baseline commit.\n",
            summary.contender_sha(),
            count,
            plural(count, "regression", "regressions"),
        );

        if count > 0 {
            md.push_str("\n### Benchmarks with regressions:\n\n");
            for entry in summary.runs() {
                // Writing into a String cannot fail.
                let _ = writeln!(
                    md,
                    "- Run ID [{}]({})",
                    entry.run.run_id,
                    entry.run.compare_url(&self.compare_base_url)
                );
                for signature in entry.distinct_signatures() {
                    let _ = writeln!(md, "  - `{}`", signature);
                }
            }
        }

        if self.warn_if_baseline_isnt_parent && !summary.baseline_is_parent() {
            md.push_str("\n### Note\n\n");
            md.push_str(BASELINE_NOT_PARENT_NOTE);
            md.push('\n');
        }

        Ok(md)
    }

    /// Short title for check runs and commit statuses.
    pub fn render_title(&self, summary: &AlertSummary) -> String {
        let count = summary.regression_count();
        format!("Found {} {}", count, plural(count, "regression", "regressions"))
    }

    /// Report published while the analysis is running.
    pub fn render_pending(&self, contender_sha: &str) -> String {
        format!("Analyzing `{}` for regressions...\n", short_sha(contender_sha))
    }

    /// Report published when the analysis itself failed.
    pub fn render_error(&self, error: &dyn std::error::Error) -> String {
        let mut md = String::from(
            "The CI build running the regression analysis failed. This does not necessarily \
mean this commit has benchmark regressions, but the error must be resolved before they can be found.\n",
        );
        let _ = write!(md, "\nError: `{}`\n", error);
        let mut source = error.source();
        while let Some(cause) = source {
            let _ = writeln!(md, "- caused by: `{}`", cause);
            source = cause.source();
        }
        md
    }
}

fn plural<'a>(count: usize, one: &'a str, many: &'a str) -> &'a str {
    if count == 1 {
        one
    } else {
        many
    }
}

fn short_sha(sha: &str) -> &str {
    sha.get(..SHORT_SHA_LEN).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::model::{Ancestry, BenchmarkComparison, RegressedRun, Run, Verdict};

    fn regressed(run_id: &str, signatures: &[&str]) -> RegressedRun {
        RegressedRun {
            run: Run::new(run_id, "abc", format!("base-{run_id}"), run_id),
            regressions: signatures
                .iter()
                .map(|s| {
                    BenchmarkComparison::new(
                        "bench",
                        s.split(", ").map(str::to_string).collect(),
                        Verdict::Regressed,
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_zero_regressions_renders_title_only() {
        let summary = AlertSummary::new("abc", vec![], &Ancestry::new("base", "abc", true));
        let md = ReportRenderer::new("https://conbench").render(&summary).unwrap();
        assert_eq!(
            md,
            "Contender commit `abc` had 0 regressions compared to its baseline commit.\n"
        );
        assert!(!md.contains("Benchmarks with regressions"));
    }

    #[test]
    fn test_single_regression_is_singular() {
        let summary = AlertSummary::new(
            "abc",
            vec![regressed("r1", &["lz4, tpch"])],
            &Ancestry::new("base", "abc", true),
        );
        let md = ReportRenderer::new("https://conbench").render(&summary).unwrap();
        assert_eq!(
            md,
            "Contender commit `abc` had 1 regression compared to its baseline commit.\n\
             \n\
             ### Benchmarks with regressions:\n\
             \n\
             - Run ID [r1](https://conbench/base-r1...r1)\n\
             \x20 - `lz4, tpch`\n"
        );
    }

    #[test]
    fn test_duplicate_signatures_listed_once() {
        let summary = AlertSummary::new(
            "abc",
            vec![regressed(
                "r1",
                &["snappy, nyctaxi_sample, parquet, arrow", "snappy, nyctaxi_sample, parquet, arrow"],
            )],
            &Ancestry::new("base", "abc", true),
        );
        let md = ReportRenderer::new("https://conbench").render(&summary).unwrap();
        assert!(md.contains("had 2 regressions"));
        assert_eq!(md.matches("`snappy, nyctaxi_sample, parquet, arrow`").count(), 1);
    }

    #[test]
    fn test_note_follows_ancestry() {
        let renderer = ReportRenderer::new("https://conbench");
        let parent = AlertSummary::new("abc", vec![], &Ancestry::new("base", "abc", true));
        let not_parent = AlertSummary::new("abc", vec![], &Ancestry::new("base", "abc", false));

        assert!(!renderer.render(&parent).unwrap().contains("### Note"));
        let md = renderer.render(&not_parent).unwrap();
        assert!(md.contains("### Note"));
        assert!(md.contains(BASELINE_NOT_PARENT_NOTE));
    }

    #[test]
    fn test_note_can_be_disabled() {
        let summary = AlertSummary::new("abc", vec![], &Ancestry::new("base", "abc", false));
        let md = ReportRenderer::new("https://conbench")
            .with_baseline_warning(false)
            .render(&summary)
            .unwrap();
        assert!(!md.contains("### Note"));
    }

    #[test]
    fn test_malformed_summaries_are_rejected() {
        let renderer = ReportRenderer::new("https://conbench");

        let empty_run = AlertSummary::from_parts("abc", 0, vec![regressed("r1", &[])], true);
        assert_eq!(
            renderer.render(&empty_run),
            Err(RenderError::MalformedSummary(ModelError::EmptyRegressedRun {
                run_id: "r1".to_string()
            }))
        );

        let wrong_count = AlertSummary::from_parts("abc", 5, vec![regressed("r1", &["a"])], true);
        assert!(matches!(
            renderer.render(&wrong_count),
            Err(RenderError::MalformedSummary(ModelError::CountMismatch { declared: 5, listed: 1 }))
        ));

        let mut improved = regressed("r1", &["lz4"]);
        improved.regressions[0].verdict = Verdict::Improved;
        let improved = AlertSummary::from_parts("abc", 1, vec![improved], true);
        assert!(matches!(
            renderer.render(&improved),
            Err(RenderError::MalformedSummary(ModelError::NonRegressedListed { .. }))
        ));
    }

    #[test]
    fn test_titles() {
        let renderer = ReportRenderer::new("https://conbench");
        let summary = AlertSummary::new(
            "abc",
            vec![regressed("r1", &["a", "b"])],
            &Ancestry::new("base", "abc", true),
        );
        assert_eq!(renderer.render_title(&summary), "Found 2 regressions");
        assert_eq!(
            renderer.render_pending("0123456789abcdef"),
            "Analyzing `01234567` for regressions...\n"
        );
        assert_eq!(renderer.render_pending("abc"), "Analyzing `abc` for regressions...\n");
    }

    #[test]
    fn test_error_report_includes_cause_chain() {
        let err = crate::error::AlertError::PublishFailure {
            cause: anyhow::anyhow!("bad credentials"),
        };
        let md = ReportRenderer::new("https://conbench").render_error(&err);
        assert!(md.contains("regression analysis failed"));
        assert!(md.contains("caused by: `bad credentials`"));
    }
}
