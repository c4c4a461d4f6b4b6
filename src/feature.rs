//! Feature flags.
//!
//! Gated behavior asks an injected [`Allocator`] whether a feature is on for
//! a given repository and root. Nothing reads flags from global state.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::types::RepoId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureName {
    /// Publish each open PR's minimum plannable revision after a deploy.
    PrRevisionSetter,
    /// Append apply-job transitions to the audit log.
    AuditLog,
}

impl FeatureName {
    pub const ALL: [FeatureName; 2] = [FeatureName::PrRevisionSetter, FeatureName::AuditLog];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureName::PrRevisionSetter => "pr-revision-setter",
            FeatureName::AuditLog => "audit-log",
        }
    }
}

impl fmt::Display for FeatureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown feature: {0}")]
pub struct UnknownFeature(pub String);

impl FromStr for FeatureName {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureName::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| UnknownFeature(s.to_string()))
    }
}

/// What a feature decision is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureContext {
    pub repo: RepoId,
    pub root: Option<String>,
}

impl FeatureContext {
    pub fn repo(repo: RepoId) -> Self {
        FeatureContext { repo, root: None }
    }

    pub fn root(repo: RepoId, root: impl Into<String>) -> Self {
        FeatureContext {
            repo,
            root: Some(root.into()),
        }
    }
}

pub trait Allocator: Send + Sync {
    fn should_allocate(&self, feature: FeatureName, ctx: &FeatureContext) -> bool;
}

/// The same answer for every repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticAllocator {
    enabled: HashSet<FeatureName>,
}

impl StaticAllocator {
    pub fn new(enabled: impl IntoIterator<Item = FeatureName>) -> Self {
        StaticAllocator {
            enabled: enabled.into_iter().collect(),
        }
    }

    pub fn all() -> Self {
        Self::new(FeatureName::ALL)
    }

    /// Parses a comma separated list such as `pr-revision-setter,audit-log`.
    /// Blank entries are ignored.
    pub fn parse(list: &str) -> Result<Self, UnknownFeature> {
        let enabled = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(FeatureName::from_str)
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(StaticAllocator { enabled })
    }

    pub fn is_enabled(&self, feature: FeatureName) -> bool {
        self.enabled.contains(&feature)
    }
}

impl Allocator for StaticAllocator {
    fn should_allocate(&self, feature: FeatureName, _ctx: &FeatureContext) -> bool {
        self.is_enabled(feature)
    }
}
