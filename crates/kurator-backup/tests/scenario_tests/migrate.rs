//! Stories about moving workloads from one cluster to others

use std::time::Duration;

use kube::runtime::controller::Action;

use kurator_backup::agent::AgentKind;
use kurator_common::crd::{find_condition, ConditionStatus, MigratePhase};
use kurator_common::velero::{BackupPhase, RestorePhase};

use super::fakes::{migrate, Harness};

const LOCATION: &str = "kurator-migrate-d-m";
const SOURCE_BACKUP: &str = "c1-migrate-d-m";

/// Story: migrating c1 into c2 and c3
///
/// The targets are not touched until the source backup completes. Each
/// target then restores once Velero has synced the backup into it through
/// the shared storage location.
#[tokio::test]
async fn story_migrate_backs_up_the_source_then_restores_the_targets() {
    let harness = Harness::new("quickstart", &["c1", "c2", "c3"]);
    harness
        .host
        .put_migrate(migrate("m", "quickstart", "c1", &["c2", "c3"]));

    // Chapter 1: only the source is written, storage location first
    let action = harness.reconcile_migrate("m").await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    assert_eq!(
        harness.agent("c1").writes(),
        vec![
            (AgentKind::StorageLocation, LOCATION.to_string()),
            (AgentKind::Backup, SOURCE_BACKUP.to_string()),
        ]
    );
    assert!(harness.agent("c2").writes().is_empty());
    assert!(harness.agent("c3").writes().is_empty());

    let status = harness.migrate_status("m");
    assert_eq!(status.phase, MigratePhase::BackupInProgress);
    let source_ready = find_condition(&status.conditions, "SourceReady").unwrap();
    assert_eq!(source_ready.status, ConditionStatus::False);
    assert_eq!(
        status
            .source_cluster_status
            .as_ref()
            .map(|d| d.agent_object_name.as_str()),
        Some(SOURCE_BACKUP)
    );

    // Chapter 2: the source backup completes but has not reached the targets
    harness
        .agent("c1")
        .set_backup_phase(SOURCE_BACKUP, BackupPhase::Completed);
    let action = harness.reconcile_migrate("m").await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(30)));

    let status = harness.migrate_status("m");
    assert_eq!(status.phase, MigratePhase::RestoreInProgress);
    let source_ready = find_condition(&status.conditions, "SourceReady").unwrap();
    assert_eq!(source_ready.status, ConditionStatus::True);
    for target in ["c2", "c3"] {
        let agent = harness.agent(target);
        assert!(
            agent.location(LOCATION).is_some(),
            "{} shares the storage location",
            target
        );
        assert!(agent.restore(&format!("{}-migrate-d-m", target)).is_none());
    }

    // Chapter 3: Velero syncs the backup into the targets
    let replicated = harness.agent("c1").backup(SOURCE_BACKUP).unwrap();
    for target in ["c2", "c3"] {
        harness.agent(target).add_backup(replicated.clone());
    }
    harness.reconcile_migrate("m").await.unwrap();
    for target in ["c2", "c3"] {
        let restore = harness
            .agent(target)
            .restore(&format!("{}-migrate-d-m", target))
            .unwrap();
        assert_eq!(restore.spec.backup_name, SOURCE_BACKUP);
    }
    let status = harness.migrate_status("m");
    assert_eq!(status.phase, MigratePhase::RestoreInProgress);
    assert_eq!(status.target_clusters_status.len(), 2);

    // Chapter 4: both restores finish
    harness
        .agent("c2")
        .set_restore_phase("c2-migrate-d-m", RestorePhase::Completed);
    harness.reconcile_migrate("m").await.unwrap();
    assert_eq!(
        harness.migrate_status("m").phase,
        MigratePhase::RestoreInProgress
    );

    harness
        .agent("c3")
        .set_restore_phase("c3-migrate-d-m", RestorePhase::Completed);
    let action = harness.reconcile_migrate("m").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(harness.migrate_status("m").phase, MigratePhase::Completed);

    // the source backup is never written again once the restore stage started
    let source_writes = harness
        .agent("c1")
        .writes()
        .into_iter()
        .filter(|(kind, _)| *kind == AgentKind::Backup)
        .count();
    assert_eq!(source_writes, 2);
}

/// Story: the source backup fails
#[tokio::test]
async fn story_failed_source_backup_fails_the_migration() {
    let harness = Harness::new("quickstart", &["c1", "c2"]);
    harness
        .host
        .put_migrate(migrate("m", "quickstart", "c1", &["c2"]));
    harness.reconcile_migrate("m").await.unwrap();

    harness
        .agent("c1")
        .set_backup_phase(SOURCE_BACKUP, BackupPhase::Failed);
    let action = harness.reconcile_migrate("m").await.unwrap();

    assert_eq!(action, Action::await_change());
    assert_eq!(harness.migrate_status("m").phase, MigratePhase::Failed);
    assert!(harness.agent("c2").writes().is_empty());
}

/// Story: the source selects more than one cluster
///
/// A migration needs exactly one source; an empty cluster list selects the
/// whole fleet and is rejected.
#[tokio::test]
async fn story_ambiguous_source_is_rejected() {
    let harness = Harness::new("quickstart", &["c1", "c2"]);
    let mut intent = migrate("m", "quickstart", "c1", &["c2"]);
    intent.spec.source_cluster.clusters.clear();
    harness.host.put_migrate(intent);

    let action = harness.reconcile_migrate("m").await.unwrap();

    assert_eq!(action, Action::await_change());
    let status = harness.migrate_status("m");
    assert_eq!(status.phase, MigratePhase::Failed);
    let violation = find_condition(&status.conditions, "InvariantViolation").unwrap();
    assert_eq!(violation.status, ConditionStatus::True);
    assert!(harness.agent("c1").writes().is_empty());
}
