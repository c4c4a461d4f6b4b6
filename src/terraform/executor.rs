//! Running Terraform commands.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerraformCommand {
    Init,
    Plan,
    Apply,
}

/// File the plan is saved to, relative to the working directory.
pub const PLAN_FILE: &str = "infra-train.tfplan";

impl TerraformCommand {
    pub fn args(&self) -> Vec<&'static str> {
        match self {
            TerraformCommand::Init => vec!["init", "-input=false", "-no-color"],
            TerraformCommand::Plan => vec!["plan", "-input=false", "-no-color", "-out", PLAN_FILE],
            TerraformCommand::Apply => vec!["apply", "-input=false", "-no-color", PLAN_FILE],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TerraformCommand::Init => "init",
            TerraformCommand::Plan => "plan",
            TerraformCommand::Apply => "apply",
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn terraform {command}: {source}")]
    Spawn {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("terraform {command} exited with {status}: {stderr}")]
    Failed {
        command: &'static str,
        status: String,
        stderr: String,
    },

    #[error("terraform {command} cancelled")]
    Cancelled { command: &'static str },
}

/// Runs one Terraform command in a working directory, returning its stdout.
pub trait Executor {
    fn execute(
        &self,
        command: TerraformCommand,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<String, ExecError>> + Send;
}

/// An [`Executor`] that spawns the Terraform binary.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    binary: PathBuf,
    env: Vec<(String, String)>,
}

impl CommandExecutor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        CommandExecutor {
            binary: binary.into(),
            env: vec![("TF_IN_AUTOMATION".into(), "1".into())],
        }
    }
}

impl Executor for CommandExecutor {
    async fn execute(
        &self,
        command: TerraformCommand,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, ExecError> {
        let name = command.name();
        debug!(command = name, workdir = %workdir.display(), "running terraform");

        let child = Command::new(&self.binary)
            .args(command.args())
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                command: name,
                source,
            })?;

        let output = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(ExecError::Cancelled { command: name }),
            output = child.wait_with_output() => output.map_err(|source| ExecError::Spawn {
                command: name,
                source,
            })?,
        };

        if !output.status.success() {
            return Err(ExecError::Failed {
                command: name,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn successful_command_returns_stdout() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::new("true");

        let out = executor
            .execute(TerraformCommand::Init, dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::new("false");

        let err = executor
            .execute(TerraformCommand::Plan, dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Failed { command: "plan", .. }));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::new("/nonexistent/terraform");

        let err = executor
            .execute(TerraformCommand::Apply, dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn cancelled_before_exit() {
        let dir = tempdir().unwrap();
        let executor = CommandExecutor::new("sleep");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = executor
            .execute(TerraformCommand::Plan, dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Cancelled { command: "plan" }));
    }

    #[test]
    fn apply_uses_saved_plan() {
        assert_eq!(TerraformCommand::Apply.args().last(), Some(&PLAN_FILE));
    }
}
