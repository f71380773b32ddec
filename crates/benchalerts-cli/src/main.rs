//! benchalerts - benchmark regression alerts
//!
//! The `benchalerts` command compares a contender commit's Conbench results
//! with its baseline and posts the verdict to GitHub.
//!
//! ## Commands
//!
//! - `comment`: post or update a regression report comment on a pull request
//! - `check`: mark a commit's check run pending, then post the report or the error
//! - `status`: same as `check`, using the commit's `conbench` status
//! - `preview`: run the analysis and print the report without posting it
//! - `render`: render a stored summary JSON file

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};

use benchalerts_clients::{
    ConbenchClient, ConbenchConfig, GitCommitGraph, GitHubAppToken, GitHubRepoClient, StaticToken, TokenProvider,
};
use benchalerts_core::{
    telemetry, AlertConfig, AlertOutcome, AlertPipeline, AlertRequest, AlertSummary, CommitGraph,
    PublishError, PublishReceipt, PublishRequest, PublishTarget, ReportPublisher, ReportRenderer,
};

#[derive(Parser)]
#[command(name = "benchalerts")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Benchmark regression alerts for pull requests and commits", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Alert configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Post or update the regression report on a pull request
    Comment {
        #[command(flatten)]
        cycle: CycleArgs,

        #[command(flatten)]
        github: GitHubArgs,

        /// Pull request number (default: the one pull request containing --sha)
        #[arg(long)]
        pr: Option<u64>,
    },

    /// Report on a commit's check run, marking it pending first
    Check {
        #[command(flatten)]
        cycle: CycleArgs,

        #[command(flatten)]
        github: GitHubArgs,

        /// CI build linked from pending and error reports
        #[arg(long, env = "BUILD_URL")]
        build_url: Option<String>,
    },

    /// Report on a commit's `conbench` status, marking it pending first
    Status {
        #[command(flatten)]
        cycle: CycleArgs,

        #[command(flatten)]
        github: GitHubArgs,

        /// CI build linked from pending and error reports
        #[arg(long, env = "BUILD_URL")]
        build_url: Option<String>,
    },

    /// Print the report without posting it
    Preview {
        #[command(flatten)]
        cycle: CycleArgs,
    },

    /// Render a stored alert summary (JSON)
    Render {
        /// Summary file
        summary: PathBuf,

        /// Prefix for run comparison links (default: from --config, else https://conbench)
        #[arg(long)]
        compare_base_url: Option<String>,
    },
}

#[derive(Args, Clone)]
struct CycleArgs {
    /// Full contender commit SHA
    #[arg(long)]
    sha: String,

    /// Conbench server URL
    #[arg(long, env = "CONBENCH_URL")]
    conbench_url: String,

    /// Conbench login email (private servers)
    #[arg(long, env = "CONBENCH_EMAIL")]
    conbench_email: Option<String>,

    /// Conbench login password (private servers)
    #[arg(long, env = "CONBENCH_PASSWORD", hide_env_values = true)]
    conbench_password: Option<String>,

    /// Z-score threshold for the comparison
    #[arg(long)]
    z_score_threshold: Option<f64>,

    /// Local checkout used to check baseline ancestry (default: ask Conbench)
    #[arg(long)]
    git_dir: Option<PathBuf>,

    /// Give up after this many seconds
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Leave out the note about a baseline that is not the direct parent
    #[arg(long)]
    no_baseline_warning: bool,
}

#[derive(Args, Clone)]
struct GitHubArgs {
    /// Repository as owner/name
    #[arg(long, env = "GITHUB_REPOSITORY")]
    repo: String,

    /// GitHub API token with repo access
    #[arg(long, env = "GITHUB_API_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// GitHub App ID; authenticates as the App instead of with a token
    #[arg(long, env = "GITHUB_APP_ID")]
    github_app_id: Option<String>,

    /// GitHub App private key (PEM contents)
    #[arg(long, env = "GITHUB_APP_PRIVATE_KEY", hide_env_values = true)]
    github_app_private_key: Option<String>,
}

impl GitHubArgs {
    /// App credentials win over a personal access token when either is set.
    fn token_provider(&self) -> Result<Arc<dyn TokenProvider>> {
        let non_empty = |v: &Option<String>| v.as_deref().filter(|v| !v.is_empty()).map(str::to_string);
        match (non_empty(&self.github_app_id), non_empty(&self.github_app_private_key)) {
            (Some(app_id), Some(key)) => {
                info!("Authenticating as GitHub App {}", app_id);
                Ok(Arc::new(GitHubAppToken::new(&app_id, &key)?))
            }
            (Some(_), None) => anyhow::bail!("GITHUB_APP_ID is set but GITHUB_APP_PRIVATE_KEY is missing"),
            (None, Some(_)) => anyhow::bail!("GITHUB_APP_PRIVATE_KEY is set but GITHUB_APP_ID is missing"),
            (None, None) => match non_empty(&self.github_token) {
                Some(token) => Ok(Arc::new(StaticToken::new(&token))),
                None => anyhow::bail!("no GitHub credentials: set GITHUB_API_TOKEN or GITHUB_APP_ID and GITHUB_APP_PRIVATE_KEY"),
            },
        }
    }

    fn client(&self) -> Result<GitHubRepoClient> {
        GitHubRepoClient::new(&self.repo, self.token_provider()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    telemetry::init_tracing(telemetry::LogFormat::from_json_flag(cli.json), level);

    match cli.command {
        Commands::Comment { cycle, github, pr } => cmd_comment(cli.config.as_deref(), &cycle, &github, pr).await,
        Commands::Check { cycle, github, build_url } => {
            let target = PublishTarget::Commit(cycle.sha.clone());
            cmd_publish(cli.config.as_deref(), &cycle, github.client()?, target, build_url).await
        }
        Commands::Status { cycle, github, build_url } => {
            let target = PublishTarget::CommitStatus(cycle.sha.clone());
            cmd_publish(cli.config.as_deref(), &cycle, github.client()?, target, build_url).await
        }
        Commands::Preview { cycle } => cmd_preview(cli.config.as_deref(), &cycle).await,
        Commands::Render { summary, compare_base_url } => {
            cmd_render(cli.config.as_deref(), &summary, compare_base_url.as_deref())
        }
    }
}

/// Config file if given, otherwise defaults pointing at the Conbench server,
/// then command-line overrides.
fn load_config(path: Option<&Path>, cycle: &CycleArgs) -> Result<AlertConfig> {
    let mut config = match path {
        Some(path) => AlertConfig::from_json_file(path)?,
        None => AlertConfig::for_conbench(&cycle.conbench_url),
    };
    if cycle.z_score_threshold.is_some() {
        config.z_score_threshold = cycle.z_score_threshold;
    }
    if cycle.no_baseline_warning {
        config.warn_if_baseline_isnt_parent = false;
    }
    Ok(config)
}

async fn connect_conbench(cycle: &CycleArgs) -> Result<Arc<ConbenchClient>> {
    let mut config = ConbenchConfig::new(&cycle.conbench_url);
    if let (Some(email), Some(password)) = (&cycle.conbench_email, &cycle.conbench_password) {
        config = config.with_login(email, password);
    }
    let client = ConbenchClient::connect(config)
        .await
        .with_context(|| format!("Failed to connect to Conbench at {}", cycle.conbench_url))?;
    Ok(Arc::new(client))
}

fn commit_graph(cycle: &CycleArgs, conbench: &Arc<ConbenchClient>) -> Arc<dyn CommitGraph> {
    match &cycle.git_dir {
        Some(dir) => Arc::new(GitCommitGraph::new(dir)),
        None => conbench.clone(),
    }
}

fn build_request(cycle: &CycleArgs, target: PublishTarget, build_url: Option<String>) -> AlertRequest {
    let mut request = AlertRequest::new(&cycle.sha, target).with_details_url(format!(
        "{}/?search={}",
        cycle.conbench_url.trim_end_matches('/'),
        cycle.sha
    ));
    if let Some(url) = build_url {
        request = request.with_build_url(url);
    }
    if let Some(secs) = cycle.deadline_secs {
        request = request.with_deadline(tokio::time::Instant::now() + Duration::from_secs(secs));
    }
    request
}

/// Comment on `--pr`, or on the pull request that contains the contender commit.
async fn cmd_comment(config_path: Option<&Path>, cycle: &CycleArgs, github: &GitHubArgs, pr: Option<u64>) -> Result<()> {
    let publisher = github.client()?;
    let pr = match pr {
        Some(pr) => pr,
        None => publisher
            .pull_number_for_commit(&cycle.sha)
            .await
            .context("Failed to find the pull request for the contender commit")?,
    };
    cmd_publish(config_path, cycle, publisher, PublishTarget::PullRequest(pr), None).await
}

/// Run one cycle and post the result to GitHub.
async fn cmd_publish(
    config_path: Option<&Path>,
    cycle: &CycleArgs,
    publisher: GitHubRepoClient,
    target: PublishTarget,
    build_url: Option<String>,
) -> Result<()> {
    let config = load_config(config_path, cycle)?;
    let conbench = connect_conbench(cycle).await?;
    let pipeline = AlertPipeline::new(
        conbench.clone(),
        commit_graph(cycle, &conbench),
        Arc::new(publisher),
        config,
    );

    let with_status = matches!(target, PublishTarget::Commit(_) | PublishTarget::CommitStatus(_));
    let request = build_request(cycle, target, build_url);
    let outcome = if with_status {
        pipeline.run_with_status(&request).await?
    } else {
        pipeline.run(&request).await?
    };

    print_outcome(&outcome);
    Ok(())
}

/// Prints the report instead of posting it.
struct StdoutPublisher;

#[async_trait]
impl ReportPublisher for StdoutPublisher {
    async fn publish(&self, request: &PublishRequest) -> Result<PublishReceipt, PublishError> {
        write_report(&mut std::io::stdout().lock(), &request.report).context("Failed to write report to stdout")?;
        Ok(PublishReceipt {
            id: "stdout".to_string(),
            url: None,
            updated_existing: false,
        })
    }
}

/// Write a report exactly as rendered; it already ends with a newline.
fn write_report(out: &mut impl Write, report: &str) -> std::io::Result<()> {
    out.write_all(report.as_bytes())?;
    out.flush()
}

async fn cmd_preview(config_path: Option<&Path>, cycle: &CycleArgs) -> Result<()> {
    let config = load_config(config_path, cycle)?;
    let conbench = connect_conbench(cycle).await?;
    let pipeline = AlertPipeline::new(
        conbench.clone(),
        commit_graph(cycle, &conbench),
        Arc::new(StdoutPublisher),
        config,
    );

    let request = build_request(cycle, PublishTarget::Commit(cycle.sha.clone()), None);
    let outcome = pipeline.run(&request).await?;
    info!(
        regressions = outcome.summary.regression_count(),
        conclusion = outcome.conclusion.as_str(),
        "Preview complete"
    );
    Ok(())
}

fn cmd_render(config_path: Option<&Path>, path: &Path, compare_base_url: Option<&str>) -> Result<()> {
    let report = render_summary_file(config_path, path, compare_base_url)?;
    print!("{}", report);
    Ok(())
}

/// Render a summary file with the config file's link prefix and note setting.
/// An explicit `compare_base_url` wins over the config file.
fn render_summary_file(config_path: Option<&Path>, path: &Path, compare_base_url: Option<&str>) -> Result<String> {
    let config = match config_path {
        Some(config_path) => AlertConfig::from_json_file(config_path)?,
        None => AlertConfig::default(),
    };
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read summary file: {:?}", path))?;
    let summary: AlertSummary =
        serde_json::from_str(&content).with_context(|| format!("Invalid summary JSON in {:?}", path))?;
    ReportRenderer::new(compare_base_url.unwrap_or(&config.compare_base_url))
        .with_baseline_warning(config.warn_if_baseline_isnt_parent)
        .render(&summary)
        .context("Failed to render summary")
}

fn print_outcome(outcome: &AlertOutcome) {
    println!("Cycle: {}", outcome.cycle_id);
    println!("Regressions: {}", outcome.summary.regression_count());
    println!("Conclusion: {}", outcome.conclusion.as_str());
    println!(
        "Posted: {}{}",
        outcome.receipt.url.as_deref().unwrap_or(&outcome.receipt.id),
        if outcome.receipt.updated_existing { " (updated)" } else { "" }
    );
}
