//! Persistence layer: deployment baselines and the apply audit trail.
//!
//! # File Layout
//!
//! ```text
//! <state_dir>/
//!   <owner>/<repo>/deployments/<root>.json   # latest deployment per root
//!   audit.jsonl                              # JSON Lines audit trail
//! ```
//!
//! # Crash Safety
//!
//! - Deployment records: written atomically using write-to-temp-then-rename
//! - Audit log: every append is fsynced; a torn final line is skipped on read

pub mod audit;
pub mod deployments;
pub mod fsync;

pub use audit::{AuditError, AuditEvent, AuditJobState, AuditSink, JsonlAuditLog};
pub use deployments::{DeploymentStore, FileDeploymentStore, StoreError};
pub use fsync::{fsync_dir, fsync_file, write_atomic};
