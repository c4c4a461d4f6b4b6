//! Effect interpreter trait.
//!
//! The trait-based design enables:
//! - Fake interpreters for testing
//! - Logging interpreters for dry runs
//! - Per-call retry policies (terminal check-run updates retry longer)

use std::future::Future;

use super::github::{GitHubEffect, GitHubResponse};
use crate::retry::RetryConfig;

/// Interprets GitHub effects against the GitHub API.
///
/// Implementations are constructed with a `RepoId`, so all effects executed
/// through a single interpreter instance are scoped to that repository.
pub trait GitHubInterpreter {
    /// The error type returned by this interpreter.
    type Error;

    /// Execute a GitHub effect, retrying transient failures according to `retry`.
    fn interpret_with_retry(
        &self,
        effect: GitHubEffect,
        retry: RetryConfig,
    ) -> impl Future<Output = Result<GitHubResponse, Self::Error>> + Send;

    /// Execute a GitHub effect with the default retry policy.
    fn interpret(
        &self,
        effect: GitHubEffect,
    ) -> impl Future<Output = Result<GitHubResponse, Self::Error>> + Send {
        self.interpret_with_retry(effect, RetryConfig::DEFAULT)
    }
}
