//! Custom Resource Definitions for the Kurator backup operator
//!
//! `Backup`, `Restore` and `Migrate` are the intents this operator owns.
//! `Fleet` and `AttachedCluster` belong to other controllers and are read only.

mod backup;
mod fleet;
mod migrate;
mod restore;
mod types;

pub use backup::{
    cron_interval, parse_cron, Backup, BackupDetail, BackupPolicy, BackupSpec, BackupStatus,
    BackupSyncPolicy, PolicyUnit,
};
pub use fleet::{
    AttachedCluster, AttachedClusterSpec, Fleet, FleetSpec, FleetStatus, SecretKeyRef,
};
pub use migrate::{Migrate, MigratePhase, MigratePolicy, MigrateSpec, MigrateStatus};
pub use restore::{
    Restore, RestoreDetail, RestorePolicy, RestoreSpec, RestoreStatus, RestoreSyncPolicy,
    RestoreUnit,
};
pub use types::{
    clear_condition, find_condition, parse_duration, set_condition, validate_ordered_resources,
    validate_ttl, BackupStorage, ClusterDetail, ClusterKind, ClusterRef, Condition,
    ConditionStatus, Destination, IntentKind, IntentPhase, PreserveStatus, ResourceFilter,
    RestoreResourceFilter, StorageLocation,
};
