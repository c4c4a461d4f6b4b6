//! GitHub API client and effect interpreter.
//!
//! This module executes `GitHubEffect`s via octocrab. It implements the
//! `GitHubInterpreter` trait defined in the effects module.
//!
//! Key features:
//! - Exponential backoff retry for transient failures
//! - Distinguishes transient vs permanent errors
//! - A shared concurrency lane for every repository client

mod client;
mod error;
mod interpreter;

pub use client::{DEFAULT_GITHUB_CONCURRENCY, GitHubLane, OctocrabClient};
pub use error::{GitHubApiError, GitHubErrorKind};
pub use interpreter::MINIMUM_REVISION_CONTEXT;
