//! Storage of the latest deployment of each root.
//!
//! # File Layout
//!
//! ```text
//! <state_dir>/<owner>/<repo>/deployments/<root>.json
//! ```
//!
//! Root names may contain `/`; they are escaped so every root maps to exactly
//! one file directly under `deployments/`.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use super::fsync::write_atomic;
use crate::retry::Retriable;
use crate::types::{DEPLOYMENT_RECORD_VERSION, DeploymentRecord, RepoId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("schema version mismatch: expected {expected}, got {got}")]
    SchemaMismatch { expected: u32, got: u32 },
}

impl Retriable for StoreError {
    fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable home of each root's "last deployed" baseline.
pub trait DeploymentStore {
    /// Returns the latest stored deployment of `root`, or `None` if it was never deployed.
    fn fetch_latest(
        &self,
        repo: &RepoId,
        root: &str,
    ) -> impl Future<Output = Result<Option<DeploymentRecord>>> + Send;

    /// Replaces the latest deployment of the record's root.
    fn store_latest(&self, record: &DeploymentRecord) -> impl Future<Output = Result<()>> + Send;
}

/// A [`DeploymentStore`] backed by one JSON file per root.
#[derive(Debug, Clone)]
pub struct FileDeploymentStore {
    state_dir: PathBuf,
}

impl FileDeploymentStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn record_path(&self, repo: &RepoId, root: &str) -> PathBuf {
        self.state_dir
            .join(&repo.owner)
            .join(&repo.repo)
            .join("deployments")
            .join(format!("{}.json", escape_root_name(root)))
    }
}

impl DeploymentStore for FileDeploymentStore {
    async fn fetch_latest(&self, repo: &RepoId, root: &str) -> Result<Option<DeploymentRecord>> {
        let path = self.record_path(repo, root);
        let record = load_record(&path)?;
        debug!(repo = %repo, root, found = record.is_some(), "fetched latest deployment");
        Ok(record)
    }

    async fn store_latest(&self, record: &DeploymentRecord) -> Result<()> {
        let path = self.record_path(&record.repo, &record.root.name);
        let bytes = serde_json::to_vec_pretty(record)?;
        write_atomic(&path, &bytes)?;
        debug!(
            repo = %record.repo,
            root = %record.root.name,
            revision = %record.revision,
            "stored latest deployment"
        );
        Ok(())
    }
}

fn load_record(path: &Path) -> Result<Option<DeploymentRecord>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let record: DeploymentRecord = serde_json::from_slice(&bytes)?;
    if record.version != DEPLOYMENT_RECORD_VERSION {
        return Err(StoreError::SchemaMismatch {
            expected: DEPLOYMENT_RECORD_VERSION,
            got: record.version,
        });
    }
    Ok(Some(record))
}

/// Percent-escapes everything outside `[A-Za-z0-9._-]`.
fn escape_root_name(root: &str) -> String {
    let mut escaped = String::with_capacity(root.len());
    for byte in root.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' => escaped.push(byte as char),
            // A leading dot would make `.` and `..` representable.
            b'.' if !escaped.is_empty() => escaped.push('.'),
            _ => escaped.push_str(&format!("%{:02X}", byte)),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::deployment;
    use crate::types::{Sha, Trigger};
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_record_is_none() {
        let dir = tempdir().unwrap();
        let store = FileDeploymentStore::new(dir.path());

        let fetched = store
            .fetch_latest(&RepoId::new("acme", "infra"), "network")
            .await
            .unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn store_then_fetch_returns_latest() {
        let dir = tempdir().unwrap();
        let store = FileDeploymentStore::new(dir.path());
        let first = DeploymentRecord::from_deployment(&deployment("aaa", Trigger::Merge));
        let second = DeploymentRecord::from_deployment(&deployment("bbb", Trigger::Manual));

        store.store_latest(&first).await.unwrap();
        store.store_latest(&second).await.unwrap();

        let fetched = store
            .fetch_latest(&first.repo, &first.root.name)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, second);
        assert_eq!(fetched.revision, Sha::new("bbb"));
    }

    #[tokio::test]
    async fn roots_are_stored_independently() {
        let dir = tempdir().unwrap();
        let store = FileDeploymentStore::new(dir.path());
        let mut info = deployment("aaa", Trigger::Merge);
        info.root.name = "live/dns".into();
        let dns = DeploymentRecord::from_deployment(&info);

        store.store_latest(&dns).await.unwrap();

        let repo = dns.repo.clone();
        assert!(store.fetch_latest(&repo, "live/dns").await.unwrap().is_some());
        assert!(store.fetch_latest(&repo, "live_dns").await.unwrap().is_none());
        assert!(store.fetch_latest(&repo, "dns").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn schema_mismatch_is_an_error() {
        let dir = tempdir().unwrap();
        let store = FileDeploymentStore::new(dir.path());
        let mut record = DeploymentRecord::from_deployment(&deployment("aaa", Trigger::Merge));
        record.version = 99;
        let path = store.record_path(&record.repo, &record.root.name);
        write_atomic(&path, &serde_json::to_vec(&record).unwrap()).unwrap();

        let err = store
            .fetch_latest(&record.repo, &record.root.name)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { got: 99, .. }));
        assert!(!err.is_retriable());
    }

    #[test]
    fn escaping_keeps_simple_names() {
        assert_eq!(escape_root_name("network-prod_1.2"), "network-prod_1.2");
        assert_eq!(escape_root_name("live/dns"), "live%2Fdns");
        assert_eq!(escape_root_name(".."), "%2E.");
    }

    proptest! {
        #[test]
        fn escaped_names_are_single_safe_components(root in "\\PC{1,30}") {
            let escaped = escape_root_name(&root);
            prop_assert!(!escaped.contains('/'));
            prop_assert!(!escaped.starts_with('.'));
            prop_assert!(escaped != "..");
        }

        #[test]
        fn escaping_is_injective(a in "[a-z/%._-]{1,10}", b in "[a-z/%._-]{1,10}") {
            prop_assume!(a != b);
            prop_assert_ne!(escape_root_name(&a), escape_root_name(&b));
        }
    }
}
