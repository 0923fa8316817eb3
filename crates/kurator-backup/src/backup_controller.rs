//! Backup reconciler
//!
//! Fans a Backup intent out to its destination clusters as one Velero
//! Backup (one-shot) or Schedule (recurring) per cluster and policy, next to
//! a shared BackupStorageLocation, and aggregates their status back.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use kurator_common::crd::{
    clear_condition, set_condition, Backup, BackupSpec, BackupStatus, ClusterRef, Condition,
    ConditionStatus, Destination, IntentKind, IntentPhase, PolicyUnit,
};
use kurator_common::{Error, STATUS_SYNC_INTERVAL};

use crate::agent::{apply_all, AgentClient, AgentObject, ClusterApply};
use crate::builder::{
    agent_labels, agent_object_name, build_backup, build_schedule, build_storage_location,
    storage_location_name,
};
use crate::cleanup::{finalize, OwnedNames};
use crate::context::{ensure_finalizer, guarded, intent_key, namespaced_name, settle, Context};
use crate::fleet::{ClusterKey, FleetClusters};
use crate::status::{
    all_completed, any_failed, fetch_backup_status, fetch_latest_schedule_status, record_violation,
    recorded_clusters, sync_details, Target,
};
use crate::{
    CONDITION_DESTINATION_RESOLVED, CONDITION_INVARIANT_VIOLATION, SCHEDULE_REQUEUE_SLACK,
};

/// Controller name used in metrics and logs
pub const CONTROLLER_NAME: &str = "backup";

/// Reconcile a Backup intent
#[instrument(skip(backup, ctx), fields(backup = %backup.name_any()))]
pub async fn reconcile(backup: Arc<Backup>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = intent_key(backup.as_ref());
    guarded(CONTROLLER_NAME, &key, &ctx, reconcile_backup(&backup, &ctx)).await
}

async fn reconcile_backup(backup: &Backup, ctx: &Context) -> Result<Action, Error> {
    let (namespace, name) = namespaced_name(backup)?;

    if backup.metadata.deletion_timestamp.is_some() {
        let units = backup.spec.policy_units();
        let destinations: Vec<&Destination> = units.iter().map(|u| u.destination).collect();
        let details = backup
            .status
            .as_ref()
            .map(|s| s.details.as_slice())
            .unwrap_or_default();
        let owned = OwnedNames::new(IntentKind::Backup, &namespace, &name)
            .with_policies(units.iter().map(|u| u.name))
            .with_recorded(details);
        info!(%namespace, %name, "backup deleted, removing agent objects");
        return finalize(ctx, &owned, &destinations, &recorded_clusters(details)).await;
    }
    ensure_finalizer(ctx, backup, IntentKind::Backup, &namespace, &name).await?;

    let current = backup.status.clone().unwrap_or_default();
    let mut status = current.clone();
    let result = sync_backup(&backup.spec, &namespace, &name, ctx, &mut status).await;
    let patched = if status != current {
        ctx.kube
            .patch_backup_status(&namespace, &name, &status)
            .await
    } else {
        Ok(())
    };
    settle(result, patched)
}

/// One planned agent object per (policy unit, member)
struct Placement<'a> {
    unit: PolicyUnit<'a>,
    member: ClusterRef,
}

/// Resolve every policy unit's destination.
///
/// `Ok(None)` means a fleet or member is missing; the condition has been
/// recorded and the caller should retry later.
async fn plan<'a>(
    spec: &'a BackupSpec,
    namespace: &str,
    ctx: &Context,
    status: &mut BackupStatus,
) -> Result<Option<Vec<Placement<'a>>>, Error> {
    let mut placements = Vec::new();
    for unit in spec.policy_units() {
        match ctx.fleet.resolve_members(namespace, unit.destination).await {
            Ok(members) => {
                placements.extend(members.into_iter().map(|member| Placement { unit, member }))
            }
            Err(e @ (Error::FleetNotFound { .. } | Error::MemberMissing { .. })) => {
                warn!(
                    error = %e,
                    fleet = %unit.destination.fleet,
                    "backup destination not resolvable"
                );
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        CONDITION_DESTINATION_RESOLVED,
                        ConditionStatus::False,
                        e.reason(),
                        e.to_string(),
                    ),
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Some(placements))
}

async fn sync_backup(
    spec: &BackupSpec,
    namespace: &str,
    name: &str,
    ctx: &Context,
    status: &mut BackupStatus,
) -> Result<Action, Error> {
    let recurring = spec.is_recurring();
    if !recurring && status.phase.is_terminal() {
        debug!(phase = %status.phase, "one-shot backup already finished");
        return Ok(Action::await_change());
    }

    if let Err(e) = spec.validate() {
        let e = e.for_intent(format!("{}/{}", namespace, name));
        warn!(error = %e, "backup spec rejected");
        record_violation(&mut status.conditions, &e);
        status.phase = IntentPhase::Failed;
        return Ok(Action::await_change());
    }
    clear_condition(&mut status.conditions, CONDITION_INVARIANT_VIOLATION);
    if status.phase == IntentPhase::Pending {
        status.phase = IntentPhase::InProgress;
    }

    let Some(placements) = plan(spec, namespace, ctx, status).await? else {
        return Ok(Action::requeue(STATUS_SYNC_INTERVAL));
    };
    let mut members: Vec<ClusterRef> = placements.iter().map(|p| p.member.clone()).collect();
    members.sort();
    members.dedup();
    let clients = ctx.fleet.clients_for(namespace, &members).await?;
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_DESTINATION_RESOLVED,
            ConditionStatus::True,
            "Resolved",
            format!("{} member cluster(s) selected", members.len()),
        ),
    );

    let (jobs, targets) = desired_objects(spec, namespace, name, &placements, &clients)?;
    let mut failures = apply_all(jobs).await;

    let outcome = if recurring {
        sync_details(
            &status.details,
            &targets,
            false,
            fetch_latest_schedule_status,
        )
        .await
    } else {
        sync_details(&status.details, &targets, true, fetch_backup_status).await
    };
    status.details = outcome.details;
    failures.extend(outcome.failures);

    let phase = if !recurring && any_failed(&status.details) {
        IntentPhase::Failed
    } else if all_completed(&status.details) {
        IntentPhase::Completed
    } else {
        IntentPhase::InProgress
    };
    if phase != status.phase {
        info!(from = %status.phase, to = %phase, "backup phase changed");
        status.phase = phase;
    }

    if let Some(e) = Error::from_failures(failures) {
        return Err(e);
    }
    if recurring {
        let interval = spec
            .schedule_interval(Utc::now())?
            .unwrap_or(STATUS_SYNC_INTERVAL);
        return Ok(Action::requeue(interval + SCHEDULE_REQUEUE_SLACK));
    }
    if status.phase.is_terminal() {
        return Ok(Action::await_change());
    }
    Ok(Action::requeue(STATUS_SYNC_INTERVAL))
}

/// Agent objects per cluster, storage location first, plus the status targets
fn desired_objects(
    spec: &BackupSpec,
    namespace: &str,
    name: &str,
    placements: &[Placement<'_>],
    clients: &FleetClusters,
) -> Result<(Vec<ClusterApply>, Vec<Target>), Error> {
    let location = storage_location_name(IntentKind::Backup, namespace, name);
    let storage_location = build_storage_location(
        &location,
        agent_labels(IntentKind::Backup, name, &spec.destination.fleet),
        &spec.storage,
    );

    let mut per_cluster: BTreeMap<ClusterKey, (Arc<dyn AgentClient>, Vec<AgentObject>)> =
        BTreeMap::new();
    let mut targets = Vec::with_capacity(placements.len());
    for placement in placements {
        let key = ClusterKey::from(&placement.member);
        let client = clients.get(&key).cloned().ok_or_else(|| {
            Error::internal_with_context("backup", format!("no client built for {}", key))
        })?;

        let object_name = agent_object_name(
            &key.name,
            IntentKind::Backup,
            namespace,
            name,
            placement.unit.name,
        );
        let labels = agent_labels(IntentKind::Backup, name, &placement.unit.destination.fleet);
        let object = match spec.schedule.as_deref().filter(|_| spec.is_recurring()) {
            Some(cron) => AgentObject::Schedule(build_schedule(
                &object_name,
                labels,
                cron,
                placement.unit.policy,
                &location,
            )),
            None => AgentObject::Backup(build_backup(
                &object_name,
                labels,
                placement.unit.policy,
                &location,
            )),
        };

        per_cluster
            .entry(key.clone())
            .or_insert_with(|| {
                (
                    client.clone(),
                    vec![AgentObject::StorageLocation(storage_location.clone())],
                )
            })
            .1
            .push(object);
        targets.push(Target {
            key,
            agent_object_name: object_name,
            client,
        });
    }

    let jobs = per_cluster
        .into_iter()
        .map(|(key, (client, objects))| ClusterApply {
            key,
            client,
            objects,
        })
        .collect();
    Ok((jobs, targets))
}
