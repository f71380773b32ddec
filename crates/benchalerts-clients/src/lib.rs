//! benchalerts clients - adapters for the alert pipeline
//!
//! - `ConbenchClient`: comparison source and commit graph backed by a Conbench server
//! - `GitHubRepoClient`: report publisher for pull request comments, check runs and commit statuses
//! - `GitHubAppToken`: GitHub App installation authentication
//! - `GitCommitGraph`: commit graph backed by a local git checkout

pub mod conbench;
pub mod error;
pub mod git;
pub mod github;

pub use conbench::{ConbenchClient, ConbenchConfig};
pub use error::ClientError;
pub use git::GitCommitGraph;
pub use github::{
    comment_marker, GitHubAppToken, GitHubRepoClient, StaticToken, TokenProvider,
    CHECK_RUN_NAME, STATUS_CONTEXT,
};
