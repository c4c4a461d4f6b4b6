//! Service configuration from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `GITHUB_TOKEN` | required |
//! | `INFRA_TRAIN_LISTEN_ADDR` | `0.0.0.0:3000` |
//! | `INFRA_TRAIN_STATE_DIR` | `./state` |
//! | `INFRA_TRAIN_CHECKOUT_DIR` | `./checkouts` |
//! | `INFRA_TRAIN_AUDIT_LOG` | `<state dir>/audit.jsonl` |
//! | `INFRA_TRAIN_TERRAFORM_BIN` | `terraform` |
//! | `INFRA_TRAIN_GITHUB_CONCURRENCY` | `4` |
//! | `INFRA_TRAIN_INACTIVITY_TIMEOUT_SECS` | one day |
//! | `INFRA_TRAIN_QUEUE_STATUS_INTERVAL_SECS` | five minutes |
//! | `INFRA_TRAIN_FEATURES` | none |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::feature::{StaticAllocator, UnknownFeature};
use crate::github::DEFAULT_GITHUB_CONCURRENCY;
use crate::worker::RunnerConfig;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_STATE_DIR: &str = "./state";
pub const DEFAULT_CHECKOUT_DIR: &str = "./checkouts";
pub const DEFAULT_TERRAFORM_BIN: &str = "terraform";
pub const AUDIT_LOG_FILE: &str = "audit.jsonl";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("INFRA_TRAIN_FEATURES: {0}")]
    Feature(#[from] UnknownFeature),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub state_dir: PathBuf,
    /// Holds `<owner>/<repo>/clone` and the per-deployment worktrees.
    pub checkout_dir: PathBuf,
    pub audit_log: PathBuf,
    pub terraform_bin: PathBuf,
    pub github_token: String,
    pub github_concurrency: usize,
    pub runner: RunnerConfig,
    pub features: StaticAllocator,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let github_token = var("GITHUB_TOKEN").ok_or(ConfigError::Missing("GITHUB_TOKEN"))?;
        let listen_addr = parse(
            "INFRA_TRAIN_LISTEN_ADDR",
            var("INFRA_TRAIN_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.into()),
        )?;
        let state_dir = PathBuf::from(
            var("INFRA_TRAIN_STATE_DIR").unwrap_or_else(|| DEFAULT_STATE_DIR.into()),
        );
        let checkout_dir = PathBuf::from(
            var("INFRA_TRAIN_CHECKOUT_DIR").unwrap_or_else(|| DEFAULT_CHECKOUT_DIR.into()),
        );
        let audit_log = var("INFRA_TRAIN_AUDIT_LOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join(AUDIT_LOG_FILE));
        let terraform_bin = PathBuf::from(
            var("INFRA_TRAIN_TERRAFORM_BIN").unwrap_or_else(|| DEFAULT_TERRAFORM_BIN.into()),
        );

        let github_concurrency = match var("INFRA_TRAIN_GITHUB_CONCURRENCY") {
            Some(v) => parse("INFRA_TRAIN_GITHUB_CONCURRENCY", v)?,
            None => DEFAULT_GITHUB_CONCURRENCY,
        };

        let mut runner = RunnerConfig::default();
        if let Some(v) = var("INFRA_TRAIN_INACTIVITY_TIMEOUT_SECS") {
            runner.inactivity_timeout = parse_secs("INFRA_TRAIN_INACTIVITY_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = var("INFRA_TRAIN_QUEUE_STATUS_INTERVAL_SECS") {
            runner.queue_status_interval = parse_secs("INFRA_TRAIN_QUEUE_STATUS_INTERVAL_SECS", v)?;
        }

        let features = StaticAllocator::parse(&var("INFRA_TRAIN_FEATURES").unwrap_or_default())?;

        Ok(Config {
            listen_addr,
            state_dir,
            checkout_dir,
            audit_log,
            terraform_bin,
            github_token,
            github_concurrency,
            runner,
            features,
        })
    }
}

fn parse<T>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}

fn parse_secs(key: &'static str, value: String) -> Result<Duration, ConfigError> {
    let secs: u64 = parse(key, value.clone())?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            value,
            reason: "must be positive".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::FeatureName;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_token_is_set() {
        let config = config(&[("GITHUB_TOKEN", "t")]).unwrap();

        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR.parse().unwrap());
        assert_eq!(config.audit_log, PathBuf::from("./state/audit.jsonl"));
        assert_eq!(config.github_concurrency, DEFAULT_GITHUB_CONCURRENCY);
        assert_eq!(config.runner, RunnerConfig::default());
        assert_eq!(config.features, StaticAllocator::default());
    }

    #[test]
    fn token_is_required() {
        assert!(matches!(config(&[]), Err(ConfigError::Missing("GITHUB_TOKEN"))));
        assert!(matches!(
            config(&[("GITHUB_TOKEN", "  ")]),
            Err(ConfigError::Missing("GITHUB_TOKEN"))
        ));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("GITHUB_TOKEN", "t"),
            ("INFRA_TRAIN_STATE_DIR", "/var/lib/infra-train"),
            ("INFRA_TRAIN_INACTIVITY_TIMEOUT_SECS", "600"),
            ("INFRA_TRAIN_GITHUB_CONCURRENCY", "8"),
            ("INFRA_TRAIN_FEATURES", "pr-revision-setter"),
        ])
        .unwrap();

        assert_eq!(config.audit_log, PathBuf::from("/var/lib/infra-train/audit.jsonl"));
        assert_eq!(config.runner.inactivity_timeout, Duration::from_secs(600));
        assert_eq!(config.github_concurrency, 8);
        assert!(config.features.is_enabled(FeatureName::PrRevisionSetter));
    }

    #[test]
    fn malformed_values_name_their_variable() {
        let err = config(&[("GITHUB_TOKEN", "t"), ("INFRA_TRAIN_LISTEN_ADDR", "nowhere")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "INFRA_TRAIN_LISTEN_ADDR", .. }));

        let err = config(&[("GITHUB_TOKEN", "t"), ("INFRA_TRAIN_QUEUE_STATUS_INTERVAL_SECS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { reason, .. } if reason == "must be positive"));
    }

    #[test]
    fn unknown_feature_is_an_error() {
        let err = config(&[("GITHUB_TOKEN", "t"), ("INFRA_TRAIN_FEATURES", "nope")]).unwrap_err();
        assert!(matches!(err, ConfigError::Feature(_)));
    }
}
