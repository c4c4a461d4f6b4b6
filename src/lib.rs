//! Infra Train - a queue-driven Terraform plan and deploy service.
//!
//! Revisions of Terraform roots arrive as signals over HTTP. Each root (and
//! each pull request) gets a runner whose worker plans and applies one
//! revision at a time, mirroring progress into GitHub check runs.

pub mod app;
pub mod config;
pub mod effects;
pub mod feature;
pub mod github;
pub mod notifier;
pub mod persistence;
pub mod rebaser;
pub mod retry;
pub mod server;
pub mod terraform;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;
