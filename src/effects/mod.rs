//! Effects-as-data for GitHub operations.
//!
//! This module defines effect types that describe operations without executing them.
//! This enables:
//! - Deployment logic that is testable against a fake interpreter
//! - Logging/tracing of intended operations
//! - Retry policy chosen per call site

pub mod github;
pub mod interpreter;

pub use github::{
    CheckRunAction, CheckRunData, CheckRunState, CommitDirection, GitHubEffect, GitHubResponse,
    PullRequestData,
};
pub use interpreter::GitHubInterpreter;
