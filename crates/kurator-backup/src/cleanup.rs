//! Cascade deletion of an intent's agent objects

use std::collections::{BTreeMap, BTreeSet};

use futures::stream::{self, StreamExt};
use kube::runtime::controller::Action;
use tracing::{info, warn};

use kurator_common::crd::{ClusterDetail, ClusterRef, Destination, IntentKind};
use kurator_common::velero;
use kurator_common::{Error, LABEL_PLUGIN_NAME, PLUGIN_NAME_BACKUP, VELERO_SCHEDULE_NAME_LABEL};

use crate::agent::{AgentClient, AgentKind};
use crate::builder::{agent_object_name, storage_location_name};
use crate::context::Context;
use crate::fleet::{ClusterKey, FleetClusters};
use crate::MAX_CLUSTER_CONCURRENCY;

/// Agent kinds an intent creates, in deletion order.
///
/// Schedules go before backups so no new backup is fired mid-cleanup, and
/// the storage location goes last.
fn owned_kinds(kind: IntentKind) -> &'static [AgentKind] {
    match kind {
        IntentKind::Backup => &[
            AgentKind::Schedule,
            AgentKind::Backup,
            AgentKind::StorageLocation,
        ],
        IntentKind::Restore => &[AgentKind::Restore],
        IntentKind::Migrate => &[
            AgentKind::Restore,
            AgentKind::Backup,
            AgentKind::StorageLocation,
        ],
    }
}

fn owner_selector(kind: IntentKind, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (kind.creator_label().to_string(), name.to_string()),
        (
            LABEL_PLUGIN_NAME.to_string(),
            PLUGIN_NAME_BACKUP.to_string(),
        ),
    ])
}

/// Agent object names an intent may have created.
///
/// Labels carry only the intent name, so same-named intents of different
/// namespaces share a selector and ownership is decided by exact name: the
/// base name of every known policy, the names recorded in the intent's
/// status, and backups a Velero schedule fired from one of those.
pub(crate) struct OwnedNames {
    kind: IntentKind,
    namespace: String,
    name: String,
    policies: BTreeSet<Option<String>>,
    recorded: BTreeSet<String>,
}

impl OwnedNames {
    pub(crate) fn new(kind: IntentKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            policies: BTreeSet::from([None]),
            recorded: BTreeSet::new(),
        }
    }

    /// Add the policy suffixes objects of this intent may carry
    pub(crate) fn with_policies<'a>(
        mut self,
        policies: impl IntoIterator<Item = Option<&'a str>>,
    ) -> Self {
        self.policies
            .extend(policies.into_iter().map(|p| p.map(str::to_string)));
        self
    }

    /// Add the agent object names recorded in the intent's status
    pub(crate) fn with_recorded<S>(mut self, details: &[ClusterDetail<S>]) -> Self {
        self.recorded
            .extend(details.iter().map(|d| d.agent_object_name.clone()));
        self
    }

    fn is_agent_object(&self, cluster: &str, object: &str) -> bool {
        self.recorded.contains(object)
            || self.policies.iter().any(|policy| {
                let (namespace, name) = (self.namespace.as_str(), self.name.as_str());
                agent_object_name(cluster, self.kind, namespace, name, policy.as_deref()) == object
            })
    }

    /// Whether `object` in `cluster` belongs to the intent
    fn contains(&self, cluster: &str, object: &str) -> bool {
        object == storage_location_name(self.kind, &self.namespace, &self.name)
            || self.is_agent_object(cluster, object)
    }

    /// Whether an agent backup in `cluster` belongs to the intent
    fn owns_backup(&self, cluster: &str, backup: &velero::Backup) -> bool {
        self.contains(cluster, &backup.metadata.name)
            || backup
                .metadata
                .labels
                .get(VELERO_SCHEDULE_NAME_LABEL)
                .is_some_and(|schedule| self.is_agent_object(cluster, schedule))
    }
}

async fn delete_in_cluster(
    client: &dyn AgentClient,
    cluster: &str,
    owned: &OwnedNames,
) -> Result<usize, Error> {
    let selector = owner_selector(owned.kind, &owned.name);
    let mut deleted = 0;
    for agent_kind in owned_kinds(owned.kind) {
        let names: Vec<String> = match agent_kind {
            AgentKind::Backup => client
                .list_backups(&selector)
                .await?
                .into_iter()
                .filter(|b| owned.owns_backup(cluster, b))
                .map(|b| b.metadata.name)
                .collect(),
            _ => client
                .list_names(*agent_kind, &selector)
                .await?
                .into_iter()
                .filter(|o| owned.contains(cluster, o))
                .collect(),
        };
        for object in &names {
            client.delete(*agent_kind, object).await?;
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Delete every agent object the intent created in the given clusters.
///
/// Objects that are already gone are skipped. Returns an error if any
/// cluster could not be cleaned, after attempting all of them.
pub(crate) async fn delete_agent_objects(
    clients: &FleetClusters,
    owned: &OwnedNames,
) -> Result<(), Error> {
    let deletes: Vec<_> = clients
        .iter()
        .map(|(key, client)| async move {
            let deleted = delete_in_cluster(client.as_ref(), &key.name, owned)
                .await
                .map_err(|e| Error::on_cluster(key.name.clone(), e))?;
            if deleted > 0 {
                info!(
                    cluster = %key,
                    intent = %owned.kind,
                    namespace = %owned.namespace,
                    name = %owned.name,
                    deleted,
                    "agent objects deleted"
                );
            }
            Ok::<(), Error>(())
        })
        .collect();
    let failures: Vec<Error> = stream::iter(deletes)
        .buffer_unordered(MAX_CLUSTER_CONCURRENCY)
        .filter_map(|r| async move { r.err() })
        .collect()
        .await;

    match Error::from_failures(failures) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Clean up a deleted intent and release its finalizer.
///
/// The clusters searched are those the destinations currently select plus
/// those already recorded in the intent's status. Destination resolution is
/// best effort: a fleet that is gone must not block deletion. A failed
/// delete is returned so the finalizer stays until the next attempt.
pub(crate) async fn finalize(
    ctx: &Context,
    owned: &OwnedNames,
    destinations: &[&Destination],
    recorded: &[ClusterRef],
) -> Result<Action, Error> {
    let (kind, namespace, name) = (owned.kind, owned.namespace.as_str(), owned.name.as_str());
    let mut members: BTreeSet<ClusterKey> = recorded.iter().map(ClusterKey::from).collect();
    for destination in destinations {
        match ctx.fleet.resolve_members(namespace, destination).await {
            Ok(found) => members.extend(found.iter().map(ClusterKey::from)),
            Err(e) => warn!(
                error = %e,
                intent = %kind,
                %namespace,
                %name,
                fleet = %destination.fleet,
                "destination not resolvable during deletion, using recorded clusters"
            ),
        }
    }

    let members: Vec<ClusterRef> = members.iter().map(ClusterRef::from).collect();
    match ctx.fleet.clients_for(namespace, &members).await {
        Ok(clients) => delete_agent_objects(&clients, owned).await?,
        Err(e) => warn!(
            error = %e,
            intent = %kind,
            %namespace,
            %name,
            "member clusters unreachable during deletion, agent objects left in place"
        ),
    }

    ctx.kube.remove_finalizer(kind, namespace, name).await?;
    info!(intent = %kind, %namespace, %name, "finalizer removed");
    Ok(Action::await_change())
}
