//! Backup, Restore and Migrate controllers for Kurator fleets
//!
//! Each intent is fanned out to the member clusters of a Fleet as Velero
//! objects, and the Velero status is aggregated back into the intent:
//!
//! - **fleet**: resolves a destination into one agent client per member cluster
//! - **agent**: typed read/write access to the Velero namespace of one member
//! - **builder**: pure translation of intent specs into Velero objects
//! - **status**: merges Velero status into per-cluster intent details
//! - **backup_controller**, **restore_controller**, **migrate_controller**:
//!   the reconcilers
//! - **context**: shared controller state, host-cluster access and error policy

pub mod agent;
pub mod backup_controller;
pub mod builder;
mod cleanup;
pub mod context;
pub mod fleet;
pub mod migrate_controller;
pub mod restore_controller;
pub mod status;
#[cfg(test)]
mod test_support;

use std::time::Duration;

pub use context::{error_policy, Context, KubeClient, KubeClientImpl};

/// Upper bound on concurrent member-cluster operations within one reconcile
pub const MAX_CLUSTER_CONCURRENCY: usize = 16;

/// Added to a cron interval so the requeue lands after the agent has fired
pub const SCHEDULE_REQUEUE_SLACK: Duration = Duration::from_secs(30);

/// Condition reporting whether the intent's destination resolved
pub const CONDITION_DESTINATION_RESOLVED: &str = "DestinationResolved";

/// Condition set when the intent can never succeed as written
pub const CONDITION_INVARIANT_VIOLATION: &str = "InvariantViolation";

/// Condition reporting whether a restore's source backup is usable
pub const CONDITION_BACKUP_READY: &str = "BackupReady";

/// Condition set on a Migrate once its source backup completed
pub const CONDITION_SOURCE_READY: &str = "SourceReady";
