//! Migrate reconciler
//!
//! Two stages driven by the phase: back up the single source cluster, then,
//! once that backup completed, restore it into every target cluster. The
//! targets see the source backup through the shared storage location, which
//! their agents sync asynchronously.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use kurator_common::crd::{
    clear_condition, set_condition, ClusterRef, Condition, ConditionStatus, Destination,
    IntentKind, Migrate, MigratePhase, MigrateSpec, MigrateStatus,
};
use kurator_common::{velero, Error, STATUS_SYNC_INTERVAL};

use crate::agent::{apply_all, AgentClient, AgentObject, ClusterApply};
use crate::builder::{
    agent_labels, agent_object_name, build_migrate_backup, build_migrate_restore,
    build_storage_location, storage_location_name,
};
use crate::cleanup::{finalize, OwnedNames};
use crate::context::{ensure_finalizer, guarded, intent_key, namespaced_name, settle, Context};
use crate::fleet::ClusterKey;
use crate::status::{
    all_completed, any_failed, fetch_backup_status, fetch_restore_status, record_violation,
    recorded_clusters, sync_details, AgentStatus, Target,
};
use crate::{
    CONDITION_DESTINATION_RESOLVED, CONDITION_INVARIANT_VIOLATION, CONDITION_SOURCE_READY,
    MAX_CLUSTER_CONCURRENCY,
};

/// Controller name used in metrics and logs
pub const CONTROLLER_NAME: &str = "migrate";

/// Reconcile a Migrate intent
#[instrument(skip(migrate, ctx), fields(migrate = %migrate.name_any()))]
pub async fn reconcile(migrate: Arc<Migrate>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = intent_key(migrate.as_ref());
    guarded(
        CONTROLLER_NAME,
        &key,
        &ctx,
        reconcile_migrate(&migrate, &ctx),
    )
    .await
}

async fn reconcile_migrate(migrate: &Migrate, ctx: &Context) -> Result<Action, Error> {
    let (namespace, name) = namespaced_name(migrate)?;

    if migrate.metadata.deletion_timestamp.is_some() {
        let destinations: Vec<&Destination> =
            vec![&migrate.spec.source_cluster, &migrate.spec.target_clusters];
        let mut owned = OwnedNames::new(IntentKind::Migrate, &namespace, &name);
        let mut recorded = Vec::new();
        if let Some(status) = &migrate.status {
            let source = status.source_cluster_status.as_slice();
            recorded.extend(recorded_clusters(source));
            recorded.extend(recorded_clusters(&status.target_clusters_status));
            owned = owned
                .with_recorded(source)
                .with_recorded(&status.target_clusters_status);
        }
        info!(%namespace, %name, "migrate deleted, removing agent objects");
        return finalize(ctx, &owned, &destinations, &recorded).await;
    }
    ensure_finalizer(ctx, migrate, IntentKind::Migrate, &namespace, &name).await?;

    let current = migrate.status.clone().unwrap_or_default();
    let mut status = current.clone();
    let result = sync_migrate(&migrate.spec, &namespace, &name, ctx, &mut status).await;
    let patched = if status != current {
        ctx.kube
            .patch_migrate_status(&namespace, &name, &status)
            .await
    } else {
        Ok(())
    };
    settle(result, patched)
}

fn reject(status: &mut MigrateStatus, error: &Error) -> Action {
    warn!(error = %error, "migrate rejected");
    record_violation(&mut status.conditions, error);
    status.phase = MigratePhase::Failed;
    Action::await_change()
}

fn source_ready(status: &mut MigrateStatus, ready: bool, reason: &str, message: impl Into<String>) {
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_SOURCE_READY,
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

/// Resolve a destination, recording unresolvable fleets and members.
///
/// `Ok(None)` means the caller should retry after the sync interval.
async fn resolve(
    ctx: &Context,
    namespace: &str,
    destination: &Destination,
    status: &mut MigrateStatus,
) -> Result<Option<Vec<ClusterRef>>, Error> {
    match ctx.fleet.resolve_members(namespace, destination).await {
        Ok(members) => Ok(Some(members)),
        Err(e @ (Error::FleetNotFound { .. } | Error::MemberMissing { .. })) => {
            warn!(error = %e, fleet = %destination.fleet, "migrate destination not resolvable");
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_DESTINATION_RESOLVED,
                    ConditionStatus::False,
                    e.reason(),
                    e.to_string(),
                ),
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

async fn sync_migrate(
    spec: &MigrateSpec,
    namespace: &str,
    name: &str,
    ctx: &Context,
    status: &mut MigrateStatus,
) -> Result<Action, Error> {
    if status.phase.is_terminal() {
        debug!(phase = %status.phase, "migrate already finished");
        return Ok(Action::await_change());
    }
    let intent = format!("{}/{}", namespace, name);

    if let Err(e) = spec.validate() {
        return Ok(reject(status, &e.for_intent(&intent)));
    }
    clear_condition(&mut status.conditions, CONDITION_INVARIANT_VIOLATION);
    if status.phase == MigratePhase::Pending {
        info!("migrate started, backing up source cluster");
        status.phase = MigratePhase::BackupInProgress;
    }

    let Some(sources) = resolve(ctx, namespace, &spec.source_cluster, status).await? else {
        return Ok(Action::requeue(STATUS_SYNC_INTERVAL));
    };
    let [source] = sources.as_slice() else {
        let e = Error::invariant(
            &intent,
            format!(
                "exactly one source cluster is required, fleet {} selects {}",
                spec.source_cluster.fleet,
                sources.len()
            ),
        );
        return Ok(reject(status, &e));
    };

    let location = storage_location_name(IntentKind::Migrate, namespace, name);
    let source_backup = agent_object_name(&source.name, IntentKind::Migrate, namespace, name, None);

    if status.phase == MigratePhase::BackupInProgress {
        let stage = backup_stage(
            spec,
            namespace,
            name,
            ctx,
            status,
            source,
            &location,
            &source_backup,
        );
        if let Some(action) = stage.await? {
            return Ok(action);
        }
    }

    restore_stage(
        spec,
        namespace,
        name,
        ctx,
        status,
        &location,
        &source_backup,
    )
    .await
}

/// Back up the source cluster.
///
/// Returns `Some` while the restore stage must not start yet.
#[allow(clippy::too_many_arguments)]
async fn backup_stage(
    spec: &MigrateSpec,
    namespace: &str,
    name: &str,
    ctx: &Context,
    status: &mut MigrateStatus,
    source: &ClusterRef,
    location: &str,
    source_backup: &str,
) -> Result<Option<Action>, Error> {
    let clients = ctx
        .fleet
        .clients_for(namespace, std::slice::from_ref(source))
        .await?;
    let key = ClusterKey::from(source);
    let client = clients.get(&key).cloned().ok_or_else(|| {
        Error::internal_with_context("migrate", format!("no client built for {}", key))
    })?;

    let labels = agent_labels(IntentKind::Migrate, name, &spec.source_cluster.fleet);
    let mut failures = apply_all(vec![ClusterApply {
        key: key.clone(),
        client: client.clone(),
        objects: vec![
            AgentObject::StorageLocation(build_storage_location(
                location,
                labels.clone(),
                &spec.storage,
            )),
            AgentObject::Backup(build_migrate_backup(
                source_backup,
                labels,
                spec.policy.as_ref(),
                location,
            )),
        ],
    }])
    .await;

    let existing: Vec<_> = status.source_cluster_status.iter().cloned().collect();
    let target = Target {
        key,
        agent_object_name: source_backup.to_string(),
        client,
    };
    let outcome = sync_details(&existing, &[target], true, fetch_backup_status).await;
    status.source_cluster_status = outcome.details.into_iter().next();
    failures.extend(outcome.failures);

    let backup_status: Option<&velero::BackupStatus> = status
        .source_cluster_status
        .as_ref()
        .and_then(|d| d.agent_object_status.as_ref());
    let failed = backup_status.is_some_and(AgentStatus::is_failed);
    let completed = backup_status.is_some_and(AgentStatus::is_completed);

    if failed {
        warn!(cluster = %source.name, backup = %source_backup, "source backup failed");
        source_ready(
            status,
            false,
            "BackupFailed",
            format!("backup {} failed", source_backup),
        );
        status.phase = MigratePhase::Failed;
        return match Error::from_failures(failures) {
            Some(e) => Err(e),
            None => Ok(Some(Action::await_change())),
        };
    }

    if completed {
        info!(
            cluster = %source.name,
            backup = %source_backup,
            "source backup completed, restoring into targets"
        );
        let message = format!("backup {} completed", source_backup);
        source_ready(status, true, "BackupCompleted", message);
        status.phase = MigratePhase::RestoreInProgress;
        return match Error::from_failures(failures) {
            Some(e) => Err(e),
            None => Ok(None),
        };
    }

    let message = format!("waiting for backup {}", source_backup);
    source_ready(status, false, "BackupInProgress", message);
    match Error::from_failures(failures) {
        Some(e) => Err(e),
        None => Ok(Some(Action::requeue(STATUS_SYNC_INTERVAL))),
    }
}

/// Outcome of one target cluster in the restore stage
enum TargetProgress {
    /// The restore has been applied
    Restoring,
    /// The source backup has not been synced into the target yet
    AwaitingReplication,
}

async fn restore_into(
    client: &dyn AgentClient,
    spec: &MigrateSpec,
    name: &str,
    location: &velero::BackupStorageLocation,
    source_backup: &str,
    restore_name: &str,
) -> Result<TargetProgress, Error> {
    client.apply_storage_location(location).await?;
    if client.get_backup(source_backup).await?.is_none() {
        return Ok(TargetProgress::AwaitingReplication);
    }
    let restore = build_migrate_restore(
        restore_name,
        agent_labels(IntentKind::Migrate, name, &spec.target_clusters.fleet),
        source_backup,
        spec.policy.as_ref(),
    );
    client.apply_restore(&restore).await?;
    Ok(TargetProgress::Restoring)
}

async fn restore_stage(
    spec: &MigrateSpec,
    namespace: &str,
    name: &str,
    ctx: &Context,
    status: &mut MigrateStatus,
    location: &str,
    source_backup: &str,
) -> Result<Action, Error> {
    let Some(members) = resolve(ctx, namespace, &spec.target_clusters, status).await? else {
        return Ok(Action::requeue(STATUS_SYNC_INTERVAL));
    };
    let clients = ctx.fleet.clients_for(namespace, &members).await?;
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_DESTINATION_RESOLVED,
            ConditionStatus::True,
            "Resolved",
            format!("{} target cluster(s) selected", members.len()),
        ),
    );

    let storage_location = build_storage_location(
        location,
        agent_labels(IntentKind::Migrate, name, &spec.target_clusters.fleet),
        &spec.storage,
    );
    let targets: Vec<Target> = clients
        .iter()
        .map(|(key, client)| Target {
            key: key.clone(),
            agent_object_name: agent_object_name(
                &key.name,
                IntentKind::Migrate,
                namespace,
                name,
                None,
            ),
            client: client.clone(),
        })
        .collect();

    let storage_location = &storage_location;
    let restores: Vec<_> = targets
        .iter()
        .map(|target| async move {
            let result = restore_into(
                target.client.as_ref(),
                spec,
                name,
                storage_location,
                source_backup,
                &target.agent_object_name,
            )
            .await;
            (target.key.name.clone(), result)
        })
        .collect();
    let progress: Vec<(String, Result<TargetProgress, Error>)> = stream::iter(restores)
        .buffer_unordered(MAX_CLUSTER_CONCURRENCY)
        .collect()
        .await;

    let mut failures = Vec::new();
    let mut awaiting = 0;
    for (cluster, result) in progress {
        match result {
            Ok(TargetProgress::Restoring) => {}
            Ok(TargetProgress::AwaitingReplication) => {
                debug!(%cluster, backup = %source_backup, "source backup not replicated yet");
                awaiting += 1;
            }
            Err(e) => failures.push(Error::on_cluster(cluster, e)),
        }
    }

    let outcome = sync_details(
        &status.target_clusters_status,
        &targets,
        true,
        fetch_restore_status,
    )
    .await;
    status.target_clusters_status = outcome.details;
    failures.extend(outcome.failures);

    let phase = if any_failed(&status.target_clusters_status) {
        MigratePhase::Failed
    } else if awaiting == 0 && all_completed(&status.target_clusters_status) {
        MigratePhase::Completed
    } else {
        MigratePhase::RestoreInProgress
    };
    if phase != status.phase {
        info!(from = %status.phase, to = %phase, "migrate phase changed");
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
