//! Restore reconciler
//!
//! Restores the agent backups of a Backup intent into the clusters that
//! hold them. The clusters are the backup's own, or a subset of them named
//! by the restore's destination.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use kurator_common::crd::{
    clear_condition, set_condition, Backup, ClusterRef, Condition, ConditionStatus, Destination,
    IntentKind, IntentPhase, PolicyUnit, Restore, RestoreStatus, RestoreUnit,
};
use kurator_common::{velero, Error, STATUS_SYNC_INTERVAL};

use crate::agent::{apply_all, AgentClient, AgentObject, ClusterApply};
use crate::builder::{agent_labels, agent_object_name, build_restore};
use crate::cleanup::{finalize, OwnedNames};
use crate::context::{ensure_finalizer, guarded, intent_key, namespaced_name, settle, Context};
use crate::fleet::{ClusterKey, FleetClusters};
use crate::status::{
    all_completed, any_failed, fetch_restore_status, latest_completed, record_violation,
    recorded_clusters, schedule_selector, sync_details, Target,
};
use crate::{
    CONDITION_BACKUP_READY, CONDITION_DESTINATION_RESOLVED, CONDITION_INVARIANT_VIOLATION,
    MAX_CLUSTER_CONCURRENCY,
};

/// Controller name used in metrics and logs
pub const CONTROLLER_NAME: &str = "restore";

/// Reconcile a Restore intent
#[instrument(skip(restore, ctx), fields(restore = %restore.name_any()))]
pub async fn reconcile(restore: Arc<Restore>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = intent_key(restore.as_ref());
    guarded(
        CONTROLLER_NAME,
        &key,
        &ctx,
        reconcile_restore(&restore, &ctx),
    )
    .await
}

async fn reconcile_restore(restore: &Restore, ctx: &Context) -> Result<Action, Error> {
    let (namespace, name) = namespaced_name(restore)?;

    if restore.metadata.deletion_timestamp.is_some() {
        // The referred backup may already be gone; its destinations only
        // widen the search beyond what the status recorded.
        let backup = ctx
            .kube
            .get_backup(&namespace, &restore.spec.backup_name)
            .await
            .ok()
            .flatten();
        let mut destinations: Vec<&Destination> = restore.spec.destination.iter().collect();
        let units = backup
            .as_ref()
            .map(|b| b.spec.policy_units())
            .unwrap_or_default();
        destinations.extend(units.iter().map(|u| u.destination));
        let details = restore
            .status
            .as_ref()
            .map(|s| s.details.as_slice())
            .unwrap_or_default();
        let owned = OwnedNames::new(IntentKind::Restore, &namespace, &name)
            .with_policies(units.iter().map(|u| u.name))
            .with_policies(restore.spec.policies.iter().map(|p| p.name.as_deref()))
            .with_recorded(details);
        info!(%namespace, %name, "restore deleted, removing agent objects");
        return finalize(ctx, &owned, &destinations, &recorded_clusters(details)).await;
    }
    ensure_finalizer(ctx, restore, IntentKind::Restore, &namespace, &name).await?;

    let current = restore.status.clone().unwrap_or_default();
    let mut status = current.clone();
    let result = sync_restore(restore, &namespace, &name, ctx, &mut status).await;
    let patched = if status != current {
        ctx.kube
            .patch_restore_status(&namespace, &name, &status)
            .await
    } else {
        Ok(())
    };
    settle(result, patched)
}

/// Where reconciliation goes after a step
enum Step<T> {
    Continue(T),
    Stop(Action),
}

fn reject(status: &mut RestoreStatus, error: &Error) -> Action {
    warn!(error = %error, "restore rejected");
    record_violation(&mut status.conditions, error);
    status.phase = IntentPhase::Failed;
    Action::await_change()
}

fn backup_ready(status: &mut RestoreStatus, ready: bool, reason: &str, message: impl Into<String>) {
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_BACKUP_READY,
            if ready {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            reason,
            message,
        ),
    );
}

/// Pair every restore unit with the backup policy it restores.
///
/// A restore without named policies restores every policy of the backup
/// using its default restore policy.
fn pair_units<'a>(
    restore: &'a Restore,
    backup: &'a Backup,
    intent: &str,
) -> Result<Vec<(RestoreUnit<'a>, PolicyUnit<'a>)>, Error> {
    let backup_units = backup.spec.policy_units();
    if restore.spec.policies.is_empty() {
        let unit = RestoreUnit {
            name: None,
            policy: restore.spec.policy.as_ref(),
        };
        return Ok(backup_units.into_iter().map(|b| (unit, b)).collect());
    }

    restore
        .spec
        .restore_units()
        .into_iter()
        .map(|unit| {
            let matched = backup_units
                .iter()
                .find(|b| b.name == unit.name)
                .copied()
                .ok_or_else(|| {
                    Error::invariant(
                        intent,
                        format!(
                            "backup {} has no policy {}",
                            backup.name_any(),
                            unit.name.unwrap_or("<unnamed>")
                        ),
                    )
                })?;
            Ok((unit, matched))
        })
        .collect()
}

/// The clusters each pair restores into.
///
/// Without a restore destination every cluster of the backup policy is
/// used. Otherwise the destination must name the backup's fleet and only
/// clusters the backup covers.
async fn restore_targets<'a>(
    restore: &Restore,
    pairs: &[(RestoreUnit<'a>, PolicyUnit<'a>)],
    namespace: &str,
    intent: &str,
    ctx: &Context,
    status: &mut RestoreStatus,
) -> Result<Step<Vec<(RestoreUnit<'a>, PolicyUnit<'a>, ClusterRef)>>, Error> {
    let mut base = Vec::with_capacity(pairs.len());
    for (restore_unit, backup_unit) in pairs {
        match ctx
            .fleet
            .resolve_members(namespace, backup_unit.destination)
            .await
        {
            Ok(members) => base.push((*restore_unit, *backup_unit, members)),
            Err(e @ (Error::FleetNotFound { .. } | Error::MemberMissing { .. })) => {
                warn!(error = %e, "backup destination not resolvable");
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        CONDITION_DESTINATION_RESOLVED,
                        ConditionStatus::False,
                        e.reason(),
                        e.to_string(),
                    ),
                );
                return Ok(Step::Stop(Action::requeue(STATUS_SYNC_INTERVAL)));
            }
            Err(e) => return Err(e),
        }
    }

    let Some(destination) = &restore.spec.destination else {
        return Ok(Step::Continue(
            base.into_iter()
                .flat_map(|(r, b, members)| members.into_iter().map(move |m| (r, b, m)))
                .collect(),
        ));
    };

    if let Some((_, unit, _)) = base
        .iter()
        .find(|(_, b, _)| b.destination.fleet != destination.fleet)
    {
        let e = Error::invariant(
            intent,
            format!(
                "restore fleet {} differs from backup fleet {}",
                destination.fleet, unit.destination.fleet
            ),
        );
        return Ok(Step::Stop(reject(status, &e)));
    }

    let requested = match ctx.fleet.resolve_members(namespace, destination).await {
        Ok(requested) => requested,
        Err(e @ Error::MemberMissing { .. }) => {
            let e = Error::invariant(intent, e.to_string());
            return Ok(Step::Stop(reject(status, &e)));
        }
        Err(e @ Error::FleetNotFound { .. }) => {
            warn!(error = %e, "restore destination not resolvable");
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_DESTINATION_RESOLVED,
                    ConditionStatus::False,
                    e.reason(),
                    e.to_string(),
                ),
            );
            return Ok(Step::Stop(Action::requeue(STATUS_SYNC_INTERVAL)));
        }
        Err(e) => return Err(e),
    };

    let covered: BTreeSet<&ClusterRef> = base.iter().flat_map(|(_, _, m)| m.iter()).collect();
    if let Some(outside) = requested.iter().find(|r| !covered.contains(r)) {
        let e = Error::invariant(
            intent,
            format!(
                "cluster {}/{} is not covered by backup {}",
                outside.kind, outside.name, restore.spec.backup_name
            ),
        );
        return Ok(Step::Stop(reject(status, &e)));
    }

    Ok(Step::Continue(
        base.into_iter()
            .flat_map(|(r, b, members)| {
                members
                    .into_iter()
                    .filter(|m| requested.contains(m))
                    .map(move |m| (r, b, m))
            })
            .collect(),
    ))
}

/// What to do in one cluster for one restore unit
enum Selection {
    /// The agent restore already exists and is left as created
    Exists,
    /// Create this agent restore
    Create(velero::Restore),
    /// The schedule has no completed backup to restore from
    NothingToRestore { cluster: String, schedule: String },
}

struct Placement<'a> {
    restore_unit: RestoreUnit<'a>,
    backup_unit: PolicyUnit<'a>,
    key: ClusterKey,
    client: Arc<dyn AgentClient>,
    object_name: String,
}

/// Pick the agent backup a new restore in this cluster reads from
async fn select(
    placement: &Placement<'_>,
    namespace: &str,
    name: &str,
    backup: &Backup,
) -> Result<Selection, Error> {
    if placement
        .client
        .get_restore(&placement.object_name)
        .await?
        .is_some()
    {
        return Ok(Selection::Exists);
    }

    let agent_backup = agent_object_name(
        &placement.key.name,
        IntentKind::Backup,
        namespace,
        &backup.name_any(),
        placement.backup_unit.name,
    );
    let source = if backup.spec.is_recurring() {
        let produced = placement
            .client
            .list_backups(&schedule_selector(&agent_backup))
            .await?;
        match latest_completed(&produced) {
            Some(latest) => latest.metadata.name.clone(),
            None => {
                return Ok(Selection::NothingToRestore {
                    cluster: placement.key.name.clone(),
                    schedule: agent_backup,
                })
            }
        }
    } else {
        agent_backup
    };

    Ok(Selection::Create(build_restore(
        &placement.object_name,
        agent_labels(
            IntentKind::Restore,
            name,
            &placement.backup_unit.destination.fleet,
        ),
        &source,
        placement.restore_unit.policy,
    )))
}

async fn sync_restore(
    restore: &Restore,
    namespace: &str,
    name: &str,
    ctx: &Context,
    status: &mut RestoreStatus,
) -> Result<Action, Error> {
    if status.phase.is_terminal() {
        debug!(phase = %status.phase, "restore already finished");
        return Ok(Action::await_change());
    }
    let intent = format!("{}/{}", namespace, name);

    if let Err(e) = restore.spec.validate() {
        return Ok(reject(status, &e.for_intent(&intent)));
    }
    clear_condition(&mut status.conditions, CONDITION_INVARIANT_VIOLATION);
    if status.phase == IntentPhase::Pending {
        status.phase = IntentPhase::InProgress;
    }

    let Some(backup) = ctx
        .kube
        .get_backup(namespace, &restore.spec.backup_name)
        .await?
    else {
        let e = Error::BackupNotFound {
            namespace: namespace.to_string(),
            name: restore.spec.backup_name.clone(),
        };
        warn!(error = %e, "referred backup does not exist");
        backup_ready(status, false, e.reason(), e.to_string());
        return Ok(Action::await_change());
    };

    if backup.spec.is_recurring() {
        backup_ready(
            status,
            true,
            "Scheduled",
            "restoring the newest completed scheduled backup",
        );
    } else {
        match backup.status.as_ref().map(|s| s.phase).unwrap_or_default() {
            IntentPhase::Completed => {
                backup_ready(status, true, "BackupCompleted", "backup completed")
            }
            IntentPhase::Failed => {
                backup_ready(status, false, "BackupFailed", "backup failed");
                let e = Error::invariant(
                    &intent,
                    format!("backup {} failed and cannot be restored", backup.name_any()),
                );
                return Ok(reject(status, &e));
            }
            phase => {
                backup_ready(
                    status,
                    false,
                    "BackupInProgress",
                    format!("backup is {}", phase),
                );
                return Ok(Action::requeue(STATUS_SYNC_INTERVAL));
            }
        }
    }

    let pairs = match pair_units(restore, &backup, &intent) {
        Ok(pairs) => pairs,
        Err(e) => return Ok(reject(status, &e)),
    };
    let targets = match restore_targets(restore, &pairs, namespace, &intent, ctx, status).await? {
        Step::Continue(targets) => targets,
        Step::Stop(action) => return Ok(action),
    };

    let mut members: Vec<ClusterRef> = targets.iter().map(|(_, _, m)| m.clone()).collect();
    members.sort();
    members.dedup();
    let clients: FleetClusters = ctx.fleet.clients_for(namespace, &members).await?;
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_DESTINATION_RESOLVED,
            ConditionStatus::True,
            "Resolved",
            format!("{} member cluster(s) selected", members.len()),
        ),
    );

    let placements = targets
        .into_iter()
        .map(|(restore_unit, backup_unit, member)| {
            let key = ClusterKey::from(&member);
            let client = clients.get(&key).cloned().ok_or_else(|| {
                Error::internal_with_context("restore", format!("no client built for {}", key))
            })?;
            // suffixed with the backup policy it reads
            let object_name = agent_object_name(
                &key.name,
                IntentKind::Restore,
                namespace,
                name,
                backup_unit.name,
            );
            Ok(Placement {
                restore_unit,
                backup_unit,
                key,
                client,
                object_name,
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let backup = &backup;
    let selects: Vec<_> = placements
        .iter()
        .enumerate()
        .map(|(i, placement)| async move { (i, select(placement, namespace, name, backup).await) })
        .collect();
    let selections: Vec<(usize, Result<Selection, Error>)> = stream::iter(selects)
        .buffer_unordered(MAX_CLUSTER_CONCURRENCY)
        .collect()
        .await;

    let mut failures = Vec::new();
    let mut creates: BTreeMap<ClusterKey, (Arc<dyn AgentClient>, Vec<AgentObject>)> =
        BTreeMap::new();
    let mut ordered = selections;
    ordered.sort_by_key(|(i, _)| *i);
    for (i, selection) in ordered {
        let placement = &placements[i];
        match selection {
            Ok(Selection::Exists) => {}
            Ok(Selection::Create(object)) => {
                creates
                    .entry(placement.key.clone())
                    .or_insert_with(|| (placement.client.clone(), Vec::new()))
                    .1
                    .push(AgentObject::Restore(object));
            }
            Ok(Selection::NothingToRestore { cluster, schedule }) => {
                let e = Error::NoCompletedBackups { cluster, schedule };
                info!(error = %e, "nothing to restore yet");
                backup_ready(status, false, e.reason(), e.to_string());
                return Ok(Action::await_change());
            }
            Err(e) => failures.push(Error::on_cluster(placement.key.name.clone(), e)),
        }
    }

    let jobs = creates
        .into_iter()
        .map(|(key, (client, objects))| ClusterApply {
            key,
            client,
            objects,
        })
        .collect();
    failures.extend(apply_all(jobs).await);

    let targets: Vec<Target> = placements
        .iter()
        .map(|p| Target {
            key: p.key.clone(),
            agent_object_name: p.object_name.clone(),
            client: p.client.clone(),
        })
        .collect();
    let outcome = sync_details(&status.details, &targets, true, fetch_restore_status).await;
    status.details = outcome.details;
    failures.extend(outcome.failures);

    let phase = if any_failed(&status.details) {
        IntentPhase::Failed
    } else if all_completed(&status.details) {
        IntentPhase::Completed
    } else {
        IntentPhase::InProgress
    };
    if phase != status.phase {
        info!(from = %status.phase, to = %phase, "restore phase changed");
        status.phase = phase;
    }

    if let Some(e) = Error::from_failures(failures) {
        return Err(e);
    }
    if status.phase.is_terminal() {
        return Ok(Action::await_change());
    }
    Ok(Action::requeue(STATUS_SYNC_INTERVAL))
}
