//! Velero resource types
//!
//! Typed structs for the Velero objects written into member clusters
//! (Backup, Schedule, Restore, BackupStorageLocation) and the status read back
//! from them. Field names follow the `velero.io/v1` schema; status phases the
//! orchestrator does not know about deserialize as `Unknown`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::kube_utils::{HasApiResource, ObjectMeta};

/// Namespace Velero runs in on every member cluster
pub const VELERO_NAMESPACE: &str = "velero";

/// API version shared by all Velero resources
pub const VELERO_API_VERSION: &str = "velero.io/v1";

/// Implements `HasApiResource`, serde defaults and a constructor for a Velero resource
macro_rules! velero_resource {
    ($ty:ident, $kind:literal, $plural:literal, $spec:ty) => {
        impl HasApiResource for $ty {
            const API_VERSION: &'static str = VELERO_API_VERSION;
            const KIND: &'static str = $kind;
            const PLURAL: &'static str = $plural;
        }

        impl $ty {
            fn default_api_version() -> String {
                <Self as HasApiResource>::API_VERSION.to_string()
            }

            fn default_kind() -> String {
                <Self as HasApiResource>::KIND.to_string()
            }

            #[doc = concat!("Create a new ", $kind, " in the given namespace")]
            pub fn new(name: impl Into<String>, namespace: impl Into<String>, spec: $spec) -> Self {
                Self {
                    api_version: Self::default_api_version(),
                    kind: Self::default_kind(),
                    metadata: ObjectMeta::new(name, namespace),
                    spec,
                    status: None,
                }
            }

            /// Replace the object's labels
            pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
                self.metadata.labels = labels;
                self
            }
        }
    };
}

// =============================================================================
// Shared Types
// =============================================================================

/// Label selector used by backup and restore resource filters
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Exact label matches
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    /// Set-based requirements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

/// A single set-based label requirement
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// Label key
    pub key: String,
    /// In, NotIn, Exists, DoesNotExist
    pub operator: String,
    /// Values for In/NotIn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

// =============================================================================
// Backup
// =============================================================================

/// Velero Backup resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// API version
    #[serde(default = "Backup::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "Backup::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Backup specification
    pub spec: BackupSpec,
    /// Observed status, only present on objects read back from a cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BackupStatus>,
}

velero_resource!(Backup, "Backup", "backups", BackupSpec);

impl Backup {
    /// Phase reported by Velero, if any
    pub fn phase(&self) -> Option<BackupPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// When Velero started processing this backup
    pub fn start_timestamp(&self) -> Option<DateTime<Utc>> {
        self.status.as_ref().and_then(|s| s.start_timestamp)
    }
}

/// Backup spec, also used as the template of a Schedule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Included namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespaces: Vec<String>,
    /// Excluded namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_namespaces: Vec<String>,
    /// Included resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_resources: Vec<String>,
    /// Excluded resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,
    /// Whether cluster-scoped resources are included
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_cluster_resources: Option<bool>,
    /// Included cluster-scoped resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_cluster_scoped_resources: Vec<String>,
    /// Excluded cluster-scoped resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_cluster_scoped_resources: Vec<String>,
    /// Included namespace-scoped resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespace_scoped_resources: Vec<String>,
    /// Excluded namespace-scoped resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_namespace_scoped_resources: Vec<String>,
    /// Label selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    /// Selectors OR-ed together
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub or_label_selectors: Vec<LabelSelector>,
    /// Retention, as a Go duration string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    /// BackupStorageLocation name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_location: Option<String>,
    /// Per-kind ordered `ns/name` lists
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ordered_resources: BTreeMap<String, String>,
    /// Timeout for asynchronous plugin operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_operation_timeout: Option<String>,
}

/// Phase of a Velero Backup
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum BackupPhase {
    /// Not yet processed
    New,
    /// Rejected by Velero's validation
    FailedValidation,
    /// Being backed up
    InProgress,
    /// Waiting for async plugin operations
    WaitingForPluginOperations,
    /// Waiting for plugin operations after partial failure
    WaitingForPluginOperationsPartiallyFailed,
    /// Finalizing
    Finalizing,
    /// Finalizing after partial failure
    FinalizingPartiallyFailed,
    /// Finished successfully
    Completed,
    /// Finished with item errors
    PartiallyFailed,
    /// Failed
    Failed,
    /// Being deleted
    Deleting,
    /// A phase this operator does not recognize
    #[serde(other)]
    Unknown,
}

impl BackupPhase {
    /// Whether the backup finished successfully
    pub fn is_completed(self) -> bool {
        self == Self::Completed
    }

    /// Whether the backup reached a terminal failure
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            Self::FailedValidation | Self::PartiallyFailed | Self::Failed
        )
    }
}

/// Observed status of a Velero Backup
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// Current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<BackupPhase>,
    /// When processing started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,
    /// When processing finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<DateTime<Utc>>,
    /// When the backup becomes eligible for garbage collection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    /// Item progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<BackupProgress>,
    /// Count of errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<i64>,
    /// Count of warnings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<i64>,
    /// Why the backup failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Validation errors reported by Velero
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
}

/// Item progress of a Velero Backup
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupProgress {
    /// Items to back up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_items: Option<i64>,
    /// Items backed up so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_backed_up: Option<i64>,
}

// =============================================================================
// Schedule
// =============================================================================

/// Velero Schedule resource
///
/// Produces Backups labelled `velero.io/schedule-name=<schedule>` on a cron.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    /// API version
    #[serde(default = "Schedule::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "Schedule::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Schedule specification
    pub spec: ScheduleSpec,
    /// Observed status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ScheduleStatus>,
}

velero_resource!(Schedule, "Schedule", "schedules", ScheduleSpec);

/// Schedule spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    /// Cron schedule expression
    pub schedule: String,
    /// Whether the schedule is paused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    /// Backup template
    pub template: BackupSpec,
}

/// Observed status of a Velero Schedule
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStatus {
    /// New, Enabled or FailedValidation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// When the schedule last produced a backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<DateTime<Utc>>,
}

// =============================================================================
// Restore
// =============================================================================

/// Velero Restore resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Restore {
    /// API version
    #[serde(default = "Restore::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "Restore::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// Restore specification
    pub spec: RestoreSpec,
    /// Observed status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RestoreStatus>,
}

velero_resource!(Restore, "Restore", "restores", RestoreSpec);

/// Restore spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Name of the Velero Backup to restore from
    pub backup_name: String,
    /// Included namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespaces: Vec<String>,
    /// Excluded namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_namespaces: Vec<String>,
    /// Included resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_resources: Vec<String>,
    /// Excluded resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,
    /// Whether cluster-scoped resources are restored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_cluster_resources: Option<bool>,
    /// Label selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    /// Selectors OR-ed together
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub or_label_selectors: Vec<LabelSelector>,
    /// Source namespace to target namespace
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespace_mapping: BTreeMap<String, String>,
    /// Which resources get their status restored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_status: Option<RestoreStatusSpec>,
    /// Keep node ports of restored services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_node_ports: Option<bool>,
}

/// Resources whose `.status` is restored
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatusSpec {
    /// Included resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_resources: Vec<String>,
    /// Excluded resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,
}

/// Phase of a Velero Restore
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum RestorePhase {
    /// Not yet processed
    New,
    /// Rejected by Velero's validation
    FailedValidation,
    /// Being restored
    InProgress,
    /// Waiting for async plugin operations
    WaitingForPluginOperations,
    /// Waiting for plugin operations after partial failure
    WaitingForPluginOperationsPartiallyFailed,
    /// Finalizing
    Finalizing,
    /// Finalizing after partial failure
    FinalizingPartiallyFailed,
    /// Finished successfully
    Completed,
    /// Finished with item errors
    PartiallyFailed,
    /// Failed
    Failed,
    /// A phase this operator does not recognize
    #[serde(other)]
    Unknown,
}

impl RestorePhase {
    /// Whether the restore finished successfully
    pub fn is_completed(self) -> bool {
        self == Self::Completed
    }

    /// Whether the restore reached a terminal failure
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            Self::FailedValidation | Self::PartiallyFailed | Self::Failed
        )
    }
}

/// Observed status of a Velero Restore
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    /// Current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RestorePhase>,
    /// When processing started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,
    /// When processing finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<DateTime<Utc>>,
    /// Item progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<RestoreProgress>,
    /// Count of errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<i64>,
    /// Count of warnings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<i64>,
    /// Why the restore failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Validation errors reported by Velero
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
}

/// Item progress of a Velero Restore
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreProgress {
    /// Items to restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_items: Option<i64>,
    /// Items restored so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_restored: Option<i64>,
}

// =============================================================================
// BackupStorageLocation
// =============================================================================

/// Velero BackupStorageLocation resource
///
/// Defines where backups are stored (S3, GCS, Azure, etc.).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocation {
    /// API version
    #[serde(default = "BackupStorageLocation::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "BackupStorageLocation::default_kind")]
    pub kind: String,
    /// Resource metadata
    pub metadata: ObjectMeta,
    /// BSL specification
    pub spec: BackupStorageLocationSpec,
    /// Observed status (phase only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
}

velero_resource!(
    BackupStorageLocation,
    "BackupStorageLocation",
    "backupstoragelocations",
    BackupStorageLocationSpec
);

/// BackupStorageLocation spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocationSpec {
    /// Provider name (aws, gcp, azure)
    pub provider: String,
    /// Object storage configuration
    pub object_storage: ObjectStorageLocation,
    /// Provider-specific configuration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    /// Credential reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<VeleroCredential>,
}

/// Object storage configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageLocation {
    /// Bucket name
    pub bucket: String,
    /// Prefix within the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Velero credential reference
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VeleroCredential {
    /// Name of the Kubernetes Secret
    pub name: String,
    /// Key within the Secret
    pub key: String,
}
