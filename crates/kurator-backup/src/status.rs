//! Aggregation of agent status into intent status
//!
//! An intent's `details` hold one entry per agent object it created, keyed
//! by `(clusterName, clusterKind, agentObjectName)`. Each sync re-reads the
//! agents and merges the result into the existing entries without
//! reordering them.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use kurator_common::crd::{
    set_condition, ClusterDetail, ClusterKind, ClusterRef, Condition, ConditionStatus,
};
use kurator_common::velero;
use kurator_common::{Error, VELERO_SCHEDULE_NAME_LABEL};

use crate::agent::AgentClient;
use crate::fleet::ClusterKey;
use crate::{CONDITION_INVARIANT_VIOLATION, MAX_CLUSTER_CONCURRENCY};

/// Terminal-state view over a Velero status
pub trait AgentStatus {
    /// The agent finished successfully
    fn is_completed(&self) -> bool;
    /// The agent finished unsuccessfully
    fn is_failed(&self) -> bool;
}

impl AgentStatus for velero::BackupStatus {
    fn is_completed(&self) -> bool {
        self.phase.is_some_and(velero::BackupPhase::is_completed)
    }

    fn is_failed(&self) -> bool {
        self.phase.is_some_and(velero::BackupPhase::is_failed)
    }
}

impl AgentStatus for velero::RestoreStatus {
    fn is_completed(&self) -> bool {
        self.phase.is_some_and(velero::RestorePhase::is_completed)
    }

    fn is_failed(&self) -> bool {
        self.phase.is_some_and(velero::RestorePhase::is_failed)
    }
}

/// One agent object whose status should be tracked
#[derive(Clone)]
pub struct Target {
    /// Member cluster holding the object
    pub key: ClusterKey,
    /// Name of the agent object (for schedules, the schedule name)
    pub agent_object_name: String,
    /// Client for the member cluster
    pub client: Arc<dyn AgentClient>,
}

/// Result of a status sync
#[derive(Debug)]
pub struct SyncOutcome<S> {
    /// Merged details, existing entries first in their original order
    pub details: Vec<ClusterDetail<S>>,
    /// One error per target whose status could not be read
    pub failures: Vec<Error>,
}

type DetailKey = (String, ClusterKind, String);

fn detail_key<S>(d: &ClusterDetail<S>) -> DetailKey {
    (
        d.cluster_name.clone(),
        d.cluster_kind,
        d.agent_object_name.clone(),
    )
}

fn target_key(t: &Target) -> DetailKey {
    (t.key.name.clone(), t.key.kind, t.agent_object_name.clone())
}

/// Merge the current agent status of every target into `existing`.
///
/// Entries that are no longer targeted are dropped; new targets are
/// appended in target order. With `freeze_completed`, an entry that already
/// reached Completed is not fetched again. A fetch that fails or finds
/// nothing keeps the previous status.
pub async fn sync_details<S, F, Fut>(
    existing: &[ClusterDetail<S>],
    targets: &[Target],
    freeze_completed: bool,
    fetch: F,
) -> SyncOutcome<S>
where
    S: AgentStatus + Clone,
    F: Fn(Arc<dyn AgentClient>, String) -> Fut,
    Fut: Future<Output = Result<Option<S>, Error>>,
{
    let targeted: HashMap<DetailKey, &Target> =
        targets.iter().map(|t| (target_key(t), t)).collect();

    let mut details: Vec<ClusterDetail<S>> = existing
        .iter()
        .filter(|d| targeted.contains_key(&detail_key(d)))
        .cloned()
        .collect();
    for target in targets {
        let key = target_key(target);
        if !details.iter().any(|d| detail_key(d) == key) {
            details.push(ClusterDetail {
                cluster_name: target.key.name.clone(),
                cluster_kind: target.key.kind,
                agent_object_name: target.agent_object_name.clone(),
                agent_object_status: None,
            });
        }
    }

    let to_fetch: Vec<(usize, &Target)> = details
        .iter()
        .enumerate()
        .filter(|(_, d)| {
            !(freeze_completed
                && d.agent_object_status
                    .as_ref()
                    .is_some_and(AgentStatus::is_completed))
        })
        .filter_map(|(i, d)| targeted.get(&detail_key(d)).map(|t| (i, *t)))
        .collect();

    let fetch = &fetch;
    let fetches: Vec<_> = to_fetch
        .into_iter()
        .map(|(i, target)| async move {
            let result = fetch(target.client.clone(), target.agent_object_name.clone()).await;
            (i, target, result)
        })
        .collect();
    let results: Vec<(usize, &Target, Result<Option<S>, Error>)> = stream::iter(fetches)
        .buffer_unordered(MAX_CLUSTER_CONCURRENCY)
        .collect()
        .await;

    let mut failures = Vec::new();
    for (i, target, result) in results {
        match result {
            Ok(Some(status)) => details[i].agent_object_status = Some(status),
            Ok(None) => {}
            Err(e) => failures.push(Error::on_cluster(target.key.name.clone(), e)),
        }
    }

    SyncOutcome { details, failures }
}

/// Status of a one-shot agent backup
pub async fn fetch_backup_status(
    client: Arc<dyn AgentClient>,
    name: String,
) -> Result<Option<velero::BackupStatus>, Error> {
    Ok(client.get_backup(&name).await?.and_then(|b| b.status))
}

/// Status of an agent restore
pub async fn fetch_restore_status(
    client: Arc<dyn AgentClient>,
    name: String,
) -> Result<Option<velero::RestoreStatus>, Error> {
    Ok(client.get_restore(&name).await?.and_then(|r| r.status))
}

/// Status of the newest backup a schedule produced
pub async fn fetch_latest_schedule_status(
    client: Arc<dyn AgentClient>,
    schedule: String,
) -> Result<Option<velero::BackupStatus>, Error> {
    let backups = client.list_backups(&schedule_selector(&schedule)).await?;
    Ok(newest_backup(&backups).and_then(|b| b.status.clone()))
}

/// Labels selecting the backups a schedule produced
pub fn schedule_selector(schedule: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(VELERO_SCHEDULE_NAME_LABEL.to_string(), schedule.to_string())])
}

/// Ordering for backups of one schedule.
///
/// Velero names scheduled backups `{schedule}-{yyyyMMddHHmmss}`, so the name
/// breaks ties. A backup that has not started yet is the newest.
fn recency(b: &velero::Backup) -> (bool, Option<chrono::DateTime<chrono::Utc>>, &str) {
    let started = b.start_timestamp();
    (started.is_none(), started, b.metadata.name.as_str())
}

/// The most recent backup regardless of phase
pub fn newest_backup(backups: &[velero::Backup]) -> Option<&velero::Backup> {
    backups.iter().max_by(|a, b| recency(a).cmp(&recency(b)))
}

/// The most recent Completed backup, by start time
pub fn latest_completed(backups: &[velero::Backup]) -> Option<&velero::Backup> {
    backups
        .iter()
        .filter(|b| b.phase().is_some_and(velero::BackupPhase::is_completed))
        .max_by(|a, b| recency(a).cmp(&recency(b)))
}

/// Every detail has reached Completed. Vacuously true for no details.
pub fn all_completed<S: AgentStatus>(details: &[ClusterDetail<S>]) -> bool {
    details.iter().all(|d| {
        d.agent_object_status
            .as_ref()
            .is_some_and(AgentStatus::is_completed)
    })
}

/// Some detail reached a failed phase
pub fn any_failed<S: AgentStatus>(details: &[ClusterDetail<S>]) -> bool {
    details.iter().any(|d| {
        d.agent_object_status
            .as_ref()
            .is_some_and(AgentStatus::is_failed)
    })
}

/// Clusters already recorded in an intent's details, deduplicated
pub fn recorded_clusters<S>(details: &[ClusterDetail<S>]) -> Vec<ClusterRef> {
    let mut clusters: Vec<ClusterRef> = details
        .iter()
        .map(|d| ClusterRef {
            name: d.cluster_name.clone(),
            kind: d.cluster_kind,
        })
        .collect();
    clusters.sort_by(|a, b| (a.kind, &a.name).cmp(&(b.kind, &b.name)));
    clusters.dedup();
    clusters
}

/// Surface an error that needs a spec change as the `InvariantViolation` condition
pub fn record_violation(conditions: &mut Vec<Condition>, error: &Error) {
    set_condition(
        conditions,
        Condition::new(
            CONDITION_INVARIANT_VIOLATION,
            ConditionStatus::True,
            error.reason(),
            error.to_string(),
        ),
    );
}
