//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., passing a
//! check run ID where a pull request number is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A pull request number within a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrNumber(pub u64);

impl fmt::Display for PrNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for PrNumber {
    fn from(n: u64) -> Self {
        PrNumber(n)
    }
}

/// A git revision (commit SHA).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sha(pub String);

impl Sha {
    /// Creates a new Sha from a string.
    ///
    /// Note: This does not validate the format.
    pub fn new(s: impl Into<String>) -> Self {
        Sha(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short (7-character) version of the SHA for display.
    pub fn short(&self) -> &str {
        self.0.get(..7).unwrap_or(&self.0)
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Sha {
    fn from(s: String) -> Self {
        Sha(s)
    }
}

impl From<&str> for Sha {
    fn from(s: &str) -> Self {
        Sha(s.to_string())
    }
}

/// A repository identifier (owner/repo format).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub repo: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        RepoId {
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Identifies one deployment (or PR plan) attempt of a root at a revision.
///
/// A fresh ID is minted for every revision a runner receives, so a rerun of
/// the same revision gets its own check run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(pub String);

impl DeploymentId {
    pub fn new(s: impl Into<String>) -> Self {
        DeploymentId(s.into())
    }

    /// Generates a new random deployment ID.
    pub fn generate() -> Self {
        DeploymentId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeploymentId {
    fn from(s: String) -> Self {
        DeploymentId(s)
    }
}

impl From<&str> for DeploymentId {
    fn from(s: &str) -> Self {
        DeploymentId(s.to_string())
    }
}

/// A GitHub check run ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckRunId(pub u64);

impl fmt::Display for CheckRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CheckRunId {
    fn from(n: u64) -> Self {
        CheckRunId(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod pr_number {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn serde_is_transparent(n: u64) {
                let json = serde_json::to_string(&PrNumber(n)).unwrap();
                prop_assert_eq!(json, n.to_string());
            }
        }

        #[test]
        fn display_has_hash_prefix() {
            assert_eq!(PrNumber(42).to_string(), "#42");
        }
    }

    mod sha {
        use super::*;

        #[test]
        fn short_truncates_to_seven() {
            let sha = Sha::new("0123456789abcdef0123456789abcdef01234567");
            assert_eq!(sha.short(), "0123456");
        }

        #[test]
        fn short_of_short_sha_is_whole() {
            assert_eq!(Sha::new("abc").short(), "abc");
        }
    }

    mod deployment_id {
        use super::*;

        #[test]
        fn generated_ids_are_unique() {
            let a = DeploymentId::generate();
            let b = DeploymentId::generate();
            assert_ne!(a, b);
            assert!(!a.as_str().is_empty());
        }

        #[test]
        fn serializes_as_bare_string() {
            let id = DeploymentId::new("dep-1");
            assert_eq!(serde_json::to_string(&id).unwrap(), "\"dep-1\"");
        }
    }

    #[test]
    fn repo_id_display() {
        assert_eq!(RepoId::new("acme", "infra").to_string(), "acme/infra");
    }
}
