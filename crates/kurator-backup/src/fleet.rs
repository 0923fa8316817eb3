//! Fleet resolution
//!
//! Turns `{namespace, Destination}` into one [`AgentClient`] per selected
//! member cluster. Nothing is cached: the map is rebuilt on every reconcile
//! so fleet membership changes take effect immediately.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kurator_common::crd::{AttachedCluster, ClusterKind, ClusterRef, Destination, Fleet};
use kurator_common::kube_utils::{client_from_kubeconfig, is_not_found};
use kurator_common::Error;

use crate::agent::{AgentClient, KubeAgentClient};
use crate::MAX_CLUSTER_CONCURRENCY;

/// Identity of a member cluster within a namespace
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterKey {
    /// Cluster name
    pub name: String,
    /// Cluster provenance
    pub kind: ClusterKind,
}

impl From<&ClusterRef> for ClusterKey {
    fn from(r: &ClusterRef) -> Self {
        Self {
            name: r.name.clone(),
            kind: r.kind,
        }
    }
}

impl From<&ClusterKey> for ClusterRef {
    fn from(k: &ClusterKey) -> Self {
        Self {
            name: k.name.clone(),
            kind: k.kind,
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Agent clients keyed by member cluster, ordered by key
pub type FleetClusters = BTreeMap<ClusterKey, Arc<dyn AgentClient>>;

/// Access to fleets and member cluster credentials on the host cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FleetManager: Send + Sync {
    /// Get a Fleet, `None` if it does not exist
    async fn get_fleet(&self, namespace: &str, name: &str) -> Result<Option<Fleet>, Error>;

    /// Build an agent client for each of the given members
    async fn build_fleet_clusters(
        &self,
        namespace: &str,
        members: &[ClusterRef],
    ) -> Result<FleetClusters, Error>;
}

/// Key under which Cluster API stores a workload cluster's kubeconfig
const CAPI_KUBECONFIG_KEY: &str = "value";

/// [`FleetManager`] reading Fleets and kubeconfig Secrets from the host cluster
pub struct KubeFleetManager {
    client: Client,
}

impl KubeFleetManager {
    /// Create a fleet manager using the host cluster client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Locate the secret holding a member's kubeconfig.
    ///
    /// Cluster API writes `{name}-kubeconfig` with key `value`; attached
    /// clusters name their secret explicitly.
    async fn kubeconfig_ref(
        &self,
        namespace: &str,
        member: &ClusterRef,
    ) -> Result<(String, String), Error> {
        match member.kind {
            ClusterKind::Cluster => Ok((
                format!("{}-kubeconfig", member.name),
                CAPI_KUBECONFIG_KEY.to_string(),
            )),
            ClusterKind::AttachedCluster => {
                let api: Api<AttachedCluster> = Api::namespaced(self.client.clone(), namespace);
                let attached = api
                    .get_opt(&member.name)
                    .await?
                    .ok_or_else(|| Error::kubeconfig(&member.name, "AttachedCluster not found"))?;
                Ok((attached.spec.kubeconfig.name, attached.spec.kubeconfig.key))
            }
        }
    }

    async fn member_client(
        &self,
        namespace: &str,
        member: &ClusterRef,
    ) -> Result<Arc<dyn AgentClient>, Error> {
        let (secret_name, key) = self.kubeconfig_ref(namespace, member).await?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = match secrets.get(&secret_name).await {
            Ok(secret) => secret,
            Err(e) if is_not_found(&e) => {
                return Err(Error::kubeconfig(
                    &member.name,
                    format!("secret {}/{} not found", namespace, secret_name),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(&key))
            .ok_or_else(|| {
                Error::kubeconfig(
                    &member.name,
                    format!("secret {}/{} has no key {:?}", namespace, secret_name, key),
                )
            })?;

        let client = client_from_kubeconfig(&member.name, &raw.0).await?;
        debug!(cluster = %member, "member cluster client built");
        Ok(Arc::new(KubeAgentClient::new(client, member.name.clone())))
    }
}

#[async_trait]
impl FleetManager for KubeFleetManager {
    async fn get_fleet(&self, namespace: &str, name: &str) -> Result<Option<Fleet>, Error> {
        let api: Api<Fleet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn build_fleet_clusters(
        &self,
        namespace: &str,
        members: &[ClusterRef],
    ) -> Result<FleetClusters, Error> {
        let futures: Vec<_> = members
            .iter()
            .map(|member| async move {
                let client = self.member_client(namespace, member).await?;
                Ok::<_, Error>((ClusterKey::from(member), client))
            })
            .collect();
        stream::iter(futures)
            .buffer_unordered(MAX_CLUSTER_CONCURRENCY)
            .try_collect()
            .await
    }
}

/// Select the members a destination names from a fleet's member list.
///
/// An empty `clusters` list selects every member. Every requested member
/// must exist in the fleet.
pub fn select_members(fleet: &Fleet, destination: &Destination) -> Result<Vec<ClusterRef>, Error> {
    let members: BTreeSet<ClusterKey> = fleet.spec.clusters.iter().map(ClusterKey::from).collect();
    if destination.clusters.is_empty() {
        return Ok(members.iter().map(ClusterRef::from).collect());
    }

    let mut selected = BTreeSet::new();
    for requested in &destination.clusters {
        let key = ClusterKey::from(requested);
        if !members.contains(&key) {
            return Err(Error::MemberMissing {
                fleet: destination.fleet.clone(),
                cluster: requested.name.clone(),
                kind: requested.kind.to_string(),
            });
        }
        selected.insert(key);
    }
    Ok(selected.iter().map(ClusterRef::from).collect())
}

/// Resolves destinations through a [`FleetManager`]
#[derive(Clone)]
pub struct FleetResolver {
    manager: Arc<dyn FleetManager>,
}

impl FleetResolver {
    /// Create a resolver
    pub fn new(manager: Arc<dyn FleetManager>) -> Self {
        Self { manager }
    }

    /// The members a destination selects, without building clients
    pub async fn resolve_members(
        &self,
        namespace: &str,
        destination: &Destination,
    ) -> Result<Vec<ClusterRef>, Error> {
        let fleet = self
            .manager
            .get_fleet(namespace, &destination.fleet)
            .await?
            .ok_or_else(|| Error::FleetNotFound {
                namespace: namespace.to_string(),
                fleet: destination.fleet.clone(),
            })?;
        select_members(&fleet, destination)
    }

    /// Agent clients for the members a destination selects
    pub async fn resolve(
        &self,
        namespace: &str,
        destination: &Destination,
    ) -> Result<FleetClusters, Error> {
        let members = self.resolve_members(namespace, destination).await?;
        self.clients_for(namespace, &members).await
    }

    /// Agent clients for an explicit member list
    pub async fn clients_for(
        &self,
        namespace: &str,
        members: &[ClusterRef],
    ) -> Result<FleetClusters, Error> {
        if members.is_empty() {
            return Ok(FleetClusters::new());
        }
        self.manager.build_fleet_clusters(namespace, members).await
    }
}
