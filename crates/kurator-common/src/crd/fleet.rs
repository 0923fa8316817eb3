//! Fleet and AttachedCluster, owned by other controllers and only read here

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ClusterRef;

/// A named set of member clusters
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fleet.kurator.dev",
    version = "v1alpha1",
    kind = "Fleet",
    plural = "fleets",
    namespaced,
    status = "FleetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct FleetSpec {
    /// Member clusters, all in the fleet's namespace
    #[serde(default)]
    pub clusters: Vec<ClusterRef>,
}

/// Fleet status as reported by the fleet controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    /// Fleet phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// A cluster joined to the control plane through its kubeconfig
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.kurator.dev",
    version = "v1alpha1",
    kind = "AttachedCluster",
    plural = "attachedclusters",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AttachedClusterSpec {
    /// Secret holding the cluster's kubeconfig
    pub kubeconfig: SecretKeyRef,
}

/// Reference to one key of a Secret in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretKeyRef {
    /// Secret name
    pub name: String,
    /// Key within the secret's data
    pub key: String,
}
