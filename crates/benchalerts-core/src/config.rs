//! Alert cycle configuration.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

/// Knobs for one alert pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertConfig {
    /// Prefix for run comparison links in the report.
    pub compare_base_url: String,

    /// Attach the non-parent baseline note to reports.
    pub warn_if_baseline_isnt_parent: bool,

    /// Z-score threshold forwarded to the benchmarking server.
    pub z_score_threshold: Option<f64>,

    /// Budget for fetching comparisons.
    pub fetch_retry: RetryConfig,

    /// Budget for publishing the report.
    pub publish_retry: RetryConfig,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            compare_base_url: "https://conbench".to_string(),
            warn_if_baseline_isnt_parent: true,
            z_score_threshold: None,
            fetch_retry: RetryConfig::default(),
            publish_retry: RetryConfig::default(),
        }
    }
}

impl AlertConfig {
    /// Point comparison links at a Conbench server's run comparison pages.
    pub fn for_conbench(server_url: &str) -> Self {
        Self {
            compare_base_url: format!("{}/compare/runs", server_url.trim_end_matches('/')),
            ..Self::default()
        }
    }

    /// Single attempt for every network call, no per-attempt timeout.
    pub fn without_retries(mut self) -> Self {
        self.fetch_retry = RetryConfig::none();
        self.publish_retry = RetryConfig::none();
        self
    }

    /// Load from a JSON file; missing fields fall back to defaults.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("parse alert config {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = AlertConfig::default();
        assert!(cfg.warn_if_baseline_isnt_parent);
        assert!(cfg.z_score_threshold.is_none());
        assert_eq!(cfg.fetch_retry, RetryConfig::default());
    }

    #[test]
    fn test_for_conbench_builds_compare_base() {
        let cfg = AlertConfig::for_conbench("https://conbench.ursa.dev/");
        assert_eq!(cfg.compare_base_url, "https://conbench.ursa.dev/compare/runs");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: AlertConfig =
            serde_json::from_str(r#"{"z_score_threshold": 5.0, "warn_if_baseline_isnt_parent": false}"#)
                .unwrap();
        assert_eq!(cfg.z_score_threshold, Some(5.0));
        assert!(!cfg.warn_if_baseline_isnt_parent);
        assert_eq!(cfg.compare_base_url, "https://conbench");
    }
}
