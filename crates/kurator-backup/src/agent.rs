//! Access to the Velero agent of one member cluster
//!
//! [`AgentClient`] is the only way the controllers touch member clusters.
//! The production implementation talks to the member's API server through
//! `DynamicObject`, so no Velero CRD types need to be registered with kube.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kurator_common::kube_utils::{is_not_found, label_selector, HasApiResource};
use kurator_common::velero::{self, VELERO_NAMESPACE};
use kurator_common::{metrics, Error, FIELD_MANAGER};

use crate::fleet::ClusterKey;
use crate::MAX_CLUSTER_CONCURRENCY;

/// Velero object kinds the controllers write
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AgentKind {
    /// velero.io/v1 Backup
    Backup,
    /// velero.io/v1 Schedule
    Schedule,
    /// velero.io/v1 Restore
    Restore,
    /// velero.io/v1 BackupStorageLocation
    StorageLocation,
}

impl AgentKind {
    /// Kubernetes kind name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Backup => velero::Backup::KIND,
            Self::Schedule => velero::Schedule::KIND,
            Self::Restore => velero::Restore::KIND,
            Self::StorageLocation => velero::BackupStorageLocation::KIND,
        }
    }

    fn api_resource(&self) -> ApiResource {
        match self {
            Self::Backup => velero::Backup::api_resource(),
            Self::Schedule => velero::Schedule::api_resource(),
            Self::Restore => velero::Restore::api_resource(),
            Self::StorageLocation => velero::BackupStorageLocation::api_resource(),
        }
    }
}

/// Read/write access to the Velero namespace of one member cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Create or update a BackupStorageLocation
    async fn apply_storage_location(
        &self,
        location: &velero::BackupStorageLocation,
    ) -> Result<(), Error>;

    /// Create or update a Backup
    async fn apply_backup(&self, backup: &velero::Backup) -> Result<(), Error>;

    /// Create or update a Schedule
    async fn apply_schedule(&self, schedule: &velero::Schedule) -> Result<(), Error>;

    /// Create or update a Restore
    async fn apply_restore(&self, restore: &velero::Restore) -> Result<(), Error>;

    /// Get a Backup by name, `None` if it does not exist
    async fn get_backup(&self, name: &str) -> Result<Option<velero::Backup>, Error>;

    /// Get a Restore by name, `None` if it does not exist
    async fn get_restore(&self, name: &str) -> Result<Option<velero::Restore>, Error>;

    /// List Backups carrying all of the given labels
    async fn list_backups(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<velero::Backup>, Error>;

    /// Names of the objects of `kind` carrying all of the given labels
    async fn list_names(
        &self,
        kind: AgentKind,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, Error>;

    /// Delete an object; an object that is already gone is not an error
    async fn delete(&self, kind: AgentKind, name: &str) -> Result<(), Error>;
}

/// [`AgentClient`] backed by a kube client for the member cluster
pub struct KubeAgentClient {
    client: Client,
    cluster: String,
    namespace: String,
}

impl KubeAgentClient {
    /// Bind a member cluster client to the Velero namespace
    pub fn new(client: Client, cluster: impl Into<String>) -> Self {
        Self {
            client,
            cluster: cluster.into(),
            namespace: VELERO_NAMESPACE.to_string(),
        }
    }

    fn api(&self, ar: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, ar)
    }

    async fn apply<T>(&self, name: &str, resource: &T) -> Result<(), Error>
    where
        T: Serialize + HasApiResource + Sync,
    {
        let value = serde_json::to_value(resource)
            .map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))?;
        self.api(&T::api_resource())
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&value),
            )
            .await?;
        debug!(cluster = %self.cluster, kind = T::KIND, %name, "agent object applied");
        metrics::record_agent_applied(T::KIND, &self.cluster);
        Ok(())
    }

    async fn get<T>(&self, name: &str) -> Result<Option<T>, Error>
    where
        T: DeserializeOwned + HasApiResource,
    {
        match self.api(&T::api_resource()).get(name).await {
            Ok(object) => parse_dynamic(object).map(Some),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(
        &self,
        ar: &ApiResource,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, Error> {
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(self.api(ar).list(&params).await?.items)
    }
}

fn parse_dynamic<T: DeserializeOwned + HasApiResource>(object: DynamicObject) -> Result<T, Error> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(|e| Error::serialization_for_kind(T::KIND, e.to_string()))
}

#[async_trait]
impl AgentClient for KubeAgentClient {
    async fn apply_storage_location(
        &self,
        location: &velero::BackupStorageLocation,
    ) -> Result<(), Error> {
        self.apply(&location.metadata.name, location).await
    }

    async fn apply_backup(&self, backup: &velero::Backup) -> Result<(), Error> {
        self.apply(&backup.metadata.name, backup).await
    }

    async fn apply_schedule(&self, schedule: &velero::Schedule) -> Result<(), Error> {
        self.apply(&schedule.metadata.name, schedule).await
    }

    async fn apply_restore(&self, restore: &velero::Restore) -> Result<(), Error> {
        self.apply(&restore.metadata.name, restore).await
    }

    async fn get_backup(&self, name: &str) -> Result<Option<velero::Backup>, Error> {
        self.get(name).await
    }

    async fn get_restore(&self, name: &str) -> Result<Option<velero::Restore>, Error> {
        self.get(name).await
    }

    async fn list_backups(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<velero::Backup>, Error> {
        self.list(&velero::Backup::api_resource(), labels)
            .await?
            .into_iter()
            .map(parse_dynamic)
            .collect()
    }

    async fn list_names(
        &self,
        kind: AgentKind,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, Error> {
        Ok(self
            .list(&kind.api_resource(), labels)
            .await?
            .into_iter()
            .filter_map(|o| o.metadata.name)
            .collect())
    }

    async fn delete(&self, kind: AgentKind, name: &str) -> Result<(), Error> {
        match self
            .api(&kind.api_resource())
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                debug!(cluster = %self.cluster, kind = kind.kind(), %name, "agent object deleted");
                metrics::record_agent_deleted(kind.kind());
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A desired Velero object
#[derive(Clone, Debug, PartialEq)]
pub enum AgentObject {
    /// Storage location shared by an intent's agent objects
    StorageLocation(velero::BackupStorageLocation),
    /// One-shot backup
    Backup(velero::Backup),
    /// Recurring backup
    Schedule(velero::Schedule),
    /// Restore
    Restore(velero::Restore),
}

impl AgentObject {
    /// Object name
    pub fn name(&self) -> &str {
        match self {
            Self::StorageLocation(o) => &o.metadata.name,
            Self::Backup(o) => &o.metadata.name,
            Self::Schedule(o) => &o.metadata.name,
            Self::Restore(o) => &o.metadata.name,
        }
    }

    /// Object kind
    pub fn kind(&self) -> AgentKind {
        match self {
            Self::StorageLocation(_) => AgentKind::StorageLocation,
            Self::Backup(_) => AgentKind::Backup,
            Self::Schedule(_) => AgentKind::Schedule,
            Self::Restore(_) => AgentKind::Restore,
        }
    }

    /// Create or update the object through `client`
    pub async fn apply(&self, client: &dyn AgentClient) -> Result<(), Error> {
        match self {
            Self::StorageLocation(o) => client.apply_storage_location(o).await,
            Self::Backup(o) => client.apply_backup(o).await,
            Self::Schedule(o) => client.apply_schedule(o).await,
            Self::Restore(o) => client.apply_restore(o).await,
        }
    }
}

/// The objects one member cluster should hold, applied in order
pub struct ClusterApply {
    /// Member cluster
    pub key: ClusterKey,
    /// Client for that cluster
    pub client: Arc<dyn AgentClient>,
    /// Objects to apply, storage location first
    pub objects: Vec<AgentObject>,
}

/// Apply every cluster's objects, clusters in parallel.
///
/// Within one cluster the first failure stops the remaining objects.
/// Returns one error per failed cluster.
pub async fn apply_all(jobs: Vec<ClusterApply>) -> Vec<Error> {
    stream::iter(jobs)
        .map(|job| async move {
            for object in &job.objects {
                object
                    .apply(job.client.as_ref())
                    .await
                    .map_err(|e| Error::on_cluster(job.key.name.clone(), e))?;
            }
            Ok::<(), Error>(())
        })
        .buffer_unordered(MAX_CLUSTER_CONCURRENCY)
        .filter_map(|r| async move { r.err() })
        .collect()
        .await
}
