//! Migrate Custom Resource Definition
//!
//! A Migrate backs up one source cluster and restores that backup into a set
//! of target clusters. The restore stage never starts before the source
//! backup has completed.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    validate_ordered_resources, BackupStorage, ClusterDetail, Condition, Destination,
    PreserveStatus, ResourceFilter,
};
use crate::{velero, Error};

/// Specification for a Migrate
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "backup.kurator.dev",
    version = "v1alpha1",
    kind = "Migrate",
    plural = "migrates",
    namespaced,
    status = "MigrateStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigrateSpec {
    /// Object storage shared by the source and target clusters
    pub storage: BackupStorage,

    /// The single cluster to migrate from
    pub source_cluster: Destination,

    /// Clusters to migrate into
    pub target_clusters: Destination,

    /// What to migrate and how to restore it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<MigratePolicy>,
}

/// Migration policy; the backup half uses the filter and ordering, the
/// restore half uses the mapping and preservation settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigratePolicy {
    /// Resource selection for the source backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_filter: Option<ResourceFilter>,

    /// Per-kind ordered `namespace/name` lists
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ordered_resources: BTreeMap<String, String>,

    /// Source namespace to target namespace
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespace_mapping: BTreeMap<String, String>,

    /// Keep node ports of restored services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_node_ports: Option<bool>,

    /// Resources whose status is restored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_status: Option<PreserveStatus>,
}

impl MigrateSpec {
    /// Validate the migrate specification
    pub fn validate(&self) -> Result<(), Error> {
        if self.source_cluster.fleet.trim().is_empty() {
            return Err(Error::validation_for_field(
                "spec.sourceCluster.fleet",
                "fleet must not be empty",
            ));
        }
        if self.source_cluster.clusters.len() > 1 {
            return Err(Error::validation_for_field(
                "spec.sourceCluster.clusters",
                format!(
                    "exactly one source cluster is required, got {}",
                    self.source_cluster.clusters.len()
                ),
            ));
        }
        if self.target_clusters.fleet.trim().is_empty() {
            return Err(Error::validation_for_field(
                "spec.targetClusters.fleet",
                "fleet must not be empty",
            ));
        }
        if let Some(policy) = &self.policy {
            validate_ordered_resources(&policy.ordered_resources, "spec.policy.orderedResources")?;
        }
        Ok(())
    }
}

/// Phase of a Migrate
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MigratePhase {
    /// Not yet reconciled
    #[default]
    Pending,
    /// Waiting for the source backup
    BackupInProgress,
    /// Source backup is done, restoring into targets
    RestoreInProgress,
    /// Every target restore completed
    Completed,
    /// The source backup or a target restore failed
    Failed,
}

impl MigratePhase {
    /// Completed or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for MigratePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::BackupInProgress => write!(f, "BackupInProgress"),
            Self::RestoreInProgress => write!(f, "RestoreInProgress"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status of a Migrate
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrateStatus {
    /// Current phase
    #[serde(default)]
    pub phase: MigratePhase,

    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// The source backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_cluster_status: Option<ClusterDetail<velero::BackupStatus>>,

    /// One entry per target restore
    #[serde(default)]
    pub target_clusters_status: Vec<ClusterDetail<velero::RestoreStatus>>,
}
