//! Common types for the Kurator backup operator: CRDs, agent wire types,
//! errors, and Kubernetes utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod leader_election;
pub mod metrics;
pub mod telemetry;
pub mod velero;

use std::time::Duration;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for Kurator system resources (leases, operator deployment)
pub const KURATOR_SYSTEM_NAMESPACE: &str = "kurator-system";

/// Field manager used for every server-side apply and status patch
pub const FIELD_MANAGER: &str = "kurator-backup-controller";

/// Label carrying the fleet an agent object was created for
pub const LABEL_FLEET: &str = "kurator.dev/fleet";

/// Label identifying the plugin that owns an agent object
pub const LABEL_PLUGIN_NAME: &str = "kurator.dev/plugin-name";

/// Plugin name stamped on every agent object
pub const PLUGIN_NAME_BACKUP: &str = "backup";

/// Label carrying the creating Backup intent
pub const LABEL_BACKUP_NAME: &str = "kurator.dev/backup-name";

/// Label carrying the creating Restore intent
pub const LABEL_RESTORE_NAME: &str = "kurator.dev/restore-name";

/// Label carrying the creating Migrate intent
pub const LABEL_MIGRATE_NAME: &str = "kurator.dev/migrate-name";

/// Label Velero puts on every backup produced by a schedule
pub const VELERO_SCHEDULE_NAME_LABEL: &str = "velero.io/schedule-name";

/// Finalizer guarding Backup intents
pub const BACKUP_FINALIZER: &str = "backup.kurator.dev";

/// Finalizer guarding Restore intents
pub const RESTORE_FINALIZER: &str = "restore.kurator.dev";

/// Finalizer guarding Migrate intents
pub const MIGRATE_FINALIZER: &str = "migrate.kurator.dev";

/// How often a non-terminal intent re-polls its agents
pub const STATUS_SYNC_INTERVAL: Duration = Duration::from_secs(30);
