//! Restore Custom Resource Definition
//!
//! A Restore replays the Velero backups produced by a Backup intent onto
//! the same clusters (or a subset of them).

use std::collections::{BTreeMap, HashSet};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    ClusterDetail, Condition, Destination, IntentPhase, PreserveStatus, RestoreResourceFilter,
};
use crate::{velero, Error};

/// Specification for a Restore
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "backup.kurator.dev",
    version = "v1alpha1",
    kind = "Restore",
    plural = "restores",
    namespaced,
    status = "RestoreStatus",
    printcolumn = r#"{"name":"Backup","type":"string","jsonPath":".spec.backupName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Backup intent (same namespace) whose backups are restored
    pub backup_name: String,

    /// Clusters to restore into; must be a subset of the backup's clusters.
    /// Defaults to the backup's destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,

    /// What to restore when no named policies are given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<RestorePolicy>,

    /// Restores of individual named backup policies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<RestoreSyncPolicy>,
}

/// How backed-up resources are applied
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestorePolicy {
    /// Resource selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_filter: Option<RestoreResourceFilter>,

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

/// Restore of one named backup policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSyncPolicy {
    /// Backup policy name; unset refers to the backup's unnamed policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// The restore policy
    #[serde(default)]
    pub policy: RestorePolicy,
}

/// One restore unit: a backup policy plus how to restore it
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RestoreUnit<'a> {
    /// Backup policy name this unit restores
    pub name: Option<&'a str>,
    /// Restore policy, `None` restores everything
    pub policy: Option<&'a RestorePolicy>,
}

impl RestoreSpec {
    /// The restore units this restore fans out
    pub fn restore_units(&self) -> Vec<RestoreUnit<'_>> {
        if self.policies.is_empty() {
            return vec![RestoreUnit {
                name: None,
                policy: self.policy.as_ref(),
            }];
        }
        self.policies
            .iter()
            .map(|p| RestoreUnit {
                name: p.name.as_deref(),
                policy: Some(&p.policy),
            })
            .collect()
    }

    /// Validate the restore specification
    pub fn validate(&self) -> Result<(), Error> {
        if self.backup_name.trim().is_empty() {
            return Err(Error::validation_for_field(
                "spec.backupName",
                "backupName must not be empty",
            ));
        }
        if let Some(dest) = &self.destination {
            if dest.fleet.trim().is_empty() {
                return Err(Error::validation_for_field(
                    "spec.destination.fleet",
                    "fleet must not be empty",
                ));
            }
        }
        let mut names = HashSet::new();
        for (i, sync) in self.policies.iter().enumerate() {
            if !names.insert(sync.name.as_deref()) {
                return Err(Error::validation_for_field(
                    format!("spec.policies[{}].name", i),
                    "policy restored more than once",
                ));
            }
        }
        Ok(())
    }
}

/// Per-cluster detail of a Restore
pub type RestoreDetail = ClusterDetail<velero::RestoreStatus>;

/// Status of a Restore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    /// Current phase
    #[serde(default)]
    pub phase: IntentPhase,

    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// One entry per agent object, in creation order
    #[serde(default)]
    pub details: Vec<RestoreDetail>,
}
