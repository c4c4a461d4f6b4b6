//! Per-deployment git worktrees.
//!
//! Each deployment (and each PR plan) runs Terraform in its own worktree,
//! detached at the deployment's revision:
//!
//! ```text
//! <checkout_dir>/<owner>/<repo>/clone                  shared clone
//! <checkout_dir>/<owner>/<repo>/worktrees/<deployment> one per deployment
//! ```
//!
//! Plan files and `.terraform` state therefore never leak between runners of
//! the same repository. The shared clone is provisioned out of band; missing
//! revisions are fetched from its `origin`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{DeploymentInfo, InvalidRootPath, Repo};

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error(transparent)]
    InvalidRootPath(#[from] InvalidRootPath),

    #[error("deployment id {0:?} is not usable as a directory name")]
    InvalidDeploymentId(String),

    #[error("git command failed: {command}\nstderr: {stderr}")]
    Git { command: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled while checking out")]
    Cancelled,
}

impl CheckoutError {
    /// Whether the request itself is bad, as opposed to the checkout failing.
    pub fn is_invalid_request(&self) -> bool {
        matches!(
            self,
            CheckoutError::InvalidRootPath(_) | CheckoutError::InvalidDeploymentId(_)
        )
    }
}

/// Materialises the source tree a deployment runs Terraform in.
pub trait Checkout {
    /// Returns the directory of the deployment's root inside its own tree.
    fn prepare(
        &self,
        info: &DeploymentInfo,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<PathBuf, CheckoutError>> + Send;

    /// Removes whatever `prepare` left behind. Idempotent.
    fn release(&self, info: &DeploymentInfo) -> impl Future<Output = ()> + Send;
}

/// A [`Checkout`] backed by `git worktree`.
#[derive(Debug, Clone)]
pub struct GitCheckout {
    checkout_dir: PathBuf,
}

impl GitCheckout {
    pub fn new(checkout_dir: impl Into<PathBuf>) -> Self {
        GitCheckout {
            checkout_dir: checkout_dir.into(),
        }
    }

    fn repo_dir(&self, repo: &Repo) -> PathBuf {
        self.checkout_dir.join(&repo.owner).join(&repo.name)
    }

    pub fn clone_dir(&self, repo: &Repo) -> PathBuf {
        self.repo_dir(repo).join("clone")
    }

    pub fn worktree_path(&self, info: &DeploymentInfo) -> Result<PathBuf, CheckoutError> {
        let id = info.id.as_str();
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
            return Err(CheckoutError::InvalidDeploymentId(id.to_string()));
        }
        Ok(self.repo_dir(&info.repo).join("worktrees").join(id))
    }

    /// Where Terraform runs for `info`.
    pub fn workdir(&self, info: &DeploymentInfo) -> Result<PathBuf, CheckoutError> {
        let root = info.root.relative_path()?;
        Ok(self.worktree_path(info)?.join(root))
    }

    async fn remove_worktree(&self, clone: &Path, worktree: &Path) -> Result<(), CheckoutError> {
        if !worktree.exists() {
            return Ok(());
        }
        let path = worktree.to_string_lossy();
        let cancel = CancellationToken::new();
        if git(clone, &["worktree", "remove", "--force", &*path], &cancel).await.is_err() {
            // Git no longer knows the directory; drop it and its metadata.
            tokio::fs::remove_dir_all(worktree).await?;
            git(clone, &["worktree", "prune"], &cancel).await?;
        }
        Ok(())
    }
}

impl Checkout for GitCheckout {
    async fn prepare(
        &self,
        info: &DeploymentInfo,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, CheckoutError> {
        let workdir = self.workdir(info)?;
        let worktree = self.worktree_path(info)?;
        let clone = self.clone_dir(&info.repo);
        let revision = info.revision().as_str();

        // Left over from an earlier attempt of this deployment.
        self.remove_worktree(&clone, &worktree).await?;
        if let Some(parent) = worktree.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let object = format!("{}^{{commit}}", revision);
        if git(&clone, &["cat-file", "-e", &object], cancel).await.is_err() {
            if cancel.is_cancelled() {
                return Err(CheckoutError::Cancelled);
            }
            debug!(repo = %info.repo, revision, "fetching revision");
            git(&clone, &["fetch", "origin", revision], cancel).await?;
        }

        let path = worktree.to_string_lossy();
        git(&clone, &["worktree", "add", "--detach", &*path, revision], cancel).await?;
        debug!(deployment = %info.id, workdir = %workdir.display(), "worktree ready");
        Ok(workdir)
    }

    async fn release(&self, info: &DeploymentInfo) {
        let Ok(worktree) = self.worktree_path(info) else {
            return;
        };
        let clone = self.clone_dir(&info.repo);
        if let Err(e) = self.remove_worktree(&clone, &worktree).await {
            warn!(deployment = %info.id, error = %e, "failed to remove worktree");
        }
    }
}

/// Runs git in `workdir` without system or user configuration.
async fn git(workdir: &Path, args: &[&str], cancel: &CancellationToken) -> Result<String, CheckoutError> {
    let child = Command::new("git")
        .args(args)
        .current_dir(workdir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::select! {
        biased;

        _ = cancel.cancelled() => return Err(CheckoutError::Cancelled),
        output = child.wait_with_output() => output?,
    };

    if !output.status.success() {
        return Err(CheckoutError::Git {
            command: format!("git {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::deployment;
    use crate::types::{DeploymentId, Sha, Trigger};
    use tempfile::tempdir;

    fn run_git(dir: &Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
            .args(["-c", "user.name=Test", "-c", "user.email=test@test.com"])
            .args(args)
            .current_dir(dir)
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .output()
            .unwrap();
        assert!(output.status.success(), "git {:?}: {}", args, String::from_utf8_lossy(&output.stderr));
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// A clone with one commit containing `live/network/main.tf`.
    fn seeded_clone(checkout: &GitCheckout, repo: &Repo) -> String {
        let clone = checkout.clone_dir(repo);
        std::fs::create_dir_all(clone.join("live/network")).unwrap();
        std::fs::write(clone.join("live/network/main.tf"), "# network\n").unwrap();
        run_git(&clone, &["init", "-q"]);
        run_git(&clone, &["add", "."]);
        run_git(&clone, &["commit", "-q", "-m", "network"]);
        run_git(&clone, &["rev-parse", "HEAD"])
    }

    #[test]
    fn workdirs_are_keyed_by_deployment() {
        let checkout = GitCheckout::new("/checkouts");
        let mut deploy = deployment("aaaa", Trigger::Merge);
        deploy.id = DeploymentId::new("dep-1");
        let mut plan = deployment("bbbb", Trigger::Merge);
        plan.id = DeploymentId::new("dep-2");

        assert_eq!(
            checkout.workdir(&deploy).unwrap(),
            PathBuf::from("/checkouts/acme/infra/worktrees/dep-1/live/network")
        );
        assert_ne!(checkout.workdir(&deploy).unwrap(), checkout.workdir(&plan).unwrap());
    }

    #[test]
    fn escaping_root_path_is_rejected() {
        let checkout = GitCheckout::new("/checkouts");
        for path in ["../../../etc", "/etc"] {
            let mut info = deployment("aaaa", Trigger::Merge);
            info.root.path = path.into();

            let err = checkout.workdir(&info).unwrap_err();
            assert!(matches!(err, CheckoutError::InvalidRootPath(_)), "{}", path);
            assert!(err.is_invalid_request());
        }
    }

    #[test]
    fn separator_in_deployment_id_is_rejected() {
        let checkout = GitCheckout::new("/checkouts");
        let mut info = deployment("aaaa", Trigger::Merge);
        info.id = DeploymentId::new("../dep");

        assert!(matches!(
            checkout.worktree_path(&info),
            Err(CheckoutError::InvalidDeploymentId(_))
        ));
    }

    #[tokio::test]
    async fn worktree_is_detached_at_the_revision_and_released() {
        let dir = tempdir().unwrap();
        let checkout = GitCheckout::new(dir.path());
        let mut info = deployment("unused", Trigger::Merge);
        let revision = seeded_clone(&checkout, &info.repo);
        info.commit.revision = Sha::new(revision.clone());

        let workdir = checkout.prepare(&info, &CancellationToken::new()).await.unwrap();

        assert_eq!(workdir, checkout.workdir(&info).unwrap());
        assert!(workdir.join("main.tf").exists());
        assert_eq!(run_git(&workdir, &["rev-parse", "HEAD"]), revision);

        // A retried attempt starts from a clean tree.
        std::fs::write(workdir.join("infra-train.tfplan"), "stale").unwrap();
        let again = checkout.prepare(&info, &CancellationToken::new()).await.unwrap();
        assert!(!again.join("infra-train.tfplan").exists());

        checkout.release(&info).await;
        assert!(!checkout.worktree_path(&info).unwrap().exists());
        // Releasing twice is fine.
        checkout.release(&info).await;
    }

    #[tokio::test]
    async fn unknown_revision_fails_to_check_out() {
        let dir = tempdir().unwrap();
        let checkout = GitCheckout::new(dir.path());
        let mut info = deployment("unused", Trigger::Merge);
        seeded_clone(&checkout, &info.repo);
        info.commit.revision = Sha::new("0".repeat(40));

        let err = checkout
            .prepare(&info, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CheckoutError::Git { .. }));
        assert!(!err.is_invalid_request());
    }
}
