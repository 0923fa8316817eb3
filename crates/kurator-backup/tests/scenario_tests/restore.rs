//! Stories about restoring a fleet backup

use std::time::Duration;

use chrono::{TimeZone, Utc};
use kube::runtime::controller::Action;

use kurator_common::crd::{find_condition, BackupSyncPolicy, ConditionStatus, IntentPhase};
use kurator_common::velero::{BackupPhase, RestorePhase};
use kurator_common::LABEL_RESTORE_NAME;

use super::fakes::{backup, destination, restore, scheduled_backup, Harness};

/// Story: restoring a completed backup into one of its two clusters
///
/// Only the requested cluster receives a restore, and it reads from the
/// backup that cluster produced.
#[tokio::test]
async fn story_restore_into_a_subset_of_the_backup() {
    let harness = Harness::new("f", &["c1", "c2"]);
    harness.completed_backup("b", "f").await;
    assert_eq!(harness.backup_status("b").phase, IntentPhase::Completed);

    harness
        .host
        .put_restore(restore("r", "b", Some(destination("f", &["c1"]))));

    // Chapter 1: one restore, in c1 only
    let action = harness.reconcile_restore("r").await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(30)));

    let created = harness.agent("c1").restore("c1-restore-d-r").unwrap();
    assert_eq!(created.spec.backup_name, "c1-backup-d-b");
    assert_eq!(created.metadata.labels[LABEL_RESTORE_NAME], "r");
    assert!(harness.agent("c2").restore("c2-restore-d-r").is_none());

    let status = harness.restore_status("r");
    assert_eq!(status.phase, IntentPhase::InProgress);
    assert_eq!(status.details.len(), 1);
    assert_eq!(status.details[0].cluster_name, "c1");
    let ready = find_condition(&status.conditions, "BackupReady").unwrap();
    assert_eq!(ready.status, ConditionStatus::True);

    // Chapter 2: the agent finishes the restore
    harness
        .agent("c1")
        .set_restore_phase("c1-restore-d-r", RestorePhase::Completed);
    let action = harness.reconcile_restore("r").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(harness.restore_status("r").phase, IntentPhase::Completed);
}

/// Story: restoring into a cluster the backup never covered
///
/// The request can never be satisfied, so it is rejected with an
/// InvariantViolation and nothing is written anywhere.
#[tokio::test]
async fn story_restore_outside_the_backup_is_rejected() {
    let harness = Harness::new("f", &["c1", "c2"]);
    harness.completed_backup("b", "f").await;
    harness
        .host
        .put_restore(restore("r", "b", Some(destination("f", &["c3"]))));

    let action = harness.reconcile_restore("r").await.unwrap();

    assert_eq!(action, Action::await_change());
    let status = harness.restore_status("r");
    assert_eq!(status.phase, IntentPhase::Failed);
    let violation = find_condition(&status.conditions, "InvariantViolation").unwrap();
    assert_eq!(violation.status, ConditionStatus::True);
    assert!(status.details.is_empty());
    for cluster in ["c1", "c2"] {
        assert!(
            harness
                .agent(cluster)
                .restore(&format!("{}-restore-d-r", cluster))
                .is_none(),
            "no restore may be written to {}",
            cluster
        );
    }
}

/// Story: restoring the latest good run of a recurring backup
///
/// The schedule produced three backups; the newest one failed, so the
/// restore reads from the newest one that completed.
#[tokio::test]
async fn story_restore_picks_the_latest_completed_scheduled_backup() {
    let harness = Harness::new("f", &["c1"]);
    harness
        .host
        .put_backup(backup("b", "f", Some("*/5 * * * *")));
    harness.reconcile_backup("b").await.unwrap();

    let agent = harness.agent("c1");
    let at = |minute| Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap();
    agent.add_backup(scheduled_backup(
        "b1",
        "c1-backup-d-b",
        BackupPhase::Completed,
        at(10),
    ));
    agent.add_backup(scheduled_backup(
        "b2",
        "c1-backup-d-b",
        BackupPhase::Failed,
        at(15),
    ));
    agent.add_backup(scheduled_backup(
        "b3",
        "c1-backup-d-b",
        BackupPhase::Completed,
        at(20),
    ));

    harness.host.put_restore(restore("r", "b", None));
    harness.reconcile_restore("r").await.unwrap();

    let created = agent.restore("c1-restore-d-r").unwrap();
    assert_eq!(created.spec.backup_name, "b3");
}

/// Story: a recurring backup whose schedule has not produced anything yet
#[tokio::test]
async fn story_restore_waits_for_a_first_completed_run() {
    let harness = Harness::new("f", &["c1"]);
    harness
        .host
        .put_backup(backup("b", "f", Some("*/5 * * * *")));
    harness.reconcile_backup("b").await.unwrap();
    harness.host.put_restore(restore("r", "b", None));

    let action = harness.reconcile_restore("r").await.unwrap();

    assert_eq!(action, Action::await_change());
    assert!(harness.agent("c1").restore("c1-restore-d-r").is_none());
    let status = harness.restore_status("r");
    let ready = find_condition(&status.conditions, "BackupReady").unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, "NoCompletedBackups");
}

/// Story: restoring from a backup that does not exist
#[tokio::test]
async fn story_restore_of_an_unknown_backup() {
    let harness = Harness::new("f", &["c1"]);
    harness.host.put_restore(restore("r", "missing", None));

    let action = harness.reconcile_restore("r").await.unwrap();

    assert_eq!(action, Action::await_change());
    let status = harness.restore_status("r");
    let ready = find_condition(&status.conditions, "BackupReady").unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, "BackupNotFound");
}

/// Story: restoring a one-shot backup that is still running
///
/// The restore waits and checks again instead of reading a partial backup.
#[tokio::test]
async fn story_restore_waits_for_the_backup_to_complete() {
    let harness = Harness::new("f", &["c1"]);
    harness.host.put_backup(backup("b", "f", None));
    harness.reconcile_backup("b").await.unwrap();
    harness.host.put_restore(restore("r", "b", None));

    let action = harness.reconcile_restore("r").await.unwrap();

    assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    assert!(harness.agent("c1").restore("c1-restore-d-r").is_none());

    // the backup completes and the restore proceeds
    harness
        .agent("c1")
        .set_backup_phase("c1-backup-d-b", BackupPhase::Completed);
    harness.reconcile_backup("b").await.unwrap();
    harness.reconcile_restore("r").await.unwrap();
    assert!(harness.agent("c1").restore("c1-restore-d-r").is_some());
}

/// Story: restoring a backup split into named policies
///
/// The restore names no policies, so every backup policy is restored, each
/// by its own agent restore.
#[tokio::test]
async fn story_restore_covers_every_backup_policy() {
    let harness = Harness::new("f", &["c1"]);
    let mut intent = backup("b", "f", None);
    intent.spec.policies = ["apps", "infra"]
        .iter()
        .map(|p| BackupSyncPolicy {
            name: Some(p.to_string()),
            destination: None,
            policy: Default::default(),
        })
        .collect();
    harness.host.put_backup(intent);
    harness.reconcile_backup("b").await.unwrap();
    for policy in ["apps", "infra"] {
        harness
            .agent("c1")
            .set_backup_phase(&format!("c1-backup-d-b-{}", policy), BackupPhase::Completed);
    }
    harness.reconcile_backup("b").await.unwrap();
    assert_eq!(harness.backup_status("b").phase, IntentPhase::Completed);

    harness.host.put_restore(restore("r", "b", None));
    harness.reconcile_restore("r").await.unwrap();

    let agent = harness.agent("c1");
    for policy in ["apps", "infra"] {
        let created = agent
            .restore(&format!("c1-restore-d-r-{}", policy))
            .unwrap();
        assert_eq!(
            created.spec.backup_name,
            format!("c1-backup-d-b-{}", policy)
        );
    }
    assert_eq!(harness.restore_status("r").details.len(), 2);
}
