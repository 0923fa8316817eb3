//! Stories about backing up every member of a fleet

use std::time::Duration;

use chrono::{TimeZone, Utc};
use kube::runtime::controller::Action;

use kurator_backup::agent::AgentKind;
use kurator_common::crd::{find_condition, ConditionStatus, IntentPhase};
use kurator_common::velero::BackupPhase;
use kurator_common::{BACKUP_FINALIZER, LABEL_BACKUP_NAME, LABEL_FLEET};

use super::fakes::{backup, scheduled_backup, Harness};

/// Story: an operator backs up the whole fleet once
///
/// Every member gets a storage location and then a backup named after the
/// cluster and the intent. The intent stays InProgress until the last
/// member's backup completes.
#[tokio::test]
async fn story_one_shot_backup_fans_out_to_every_member() {
    let harness = Harness::new("f", &["c1", "c2"]);
    harness.host.put_backup(backup("b", "f", None));

    // Chapter 1: the first reconcile creates the agent objects
    let action = harness.reconcile_backup("b").await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(30)));

    for cluster in ["c1", "c2"] {
        let agent = harness.agent(cluster);
        let name = format!("{}-backup-d-b", cluster);
        assert_eq!(
            agent.writes(),
            vec![
                (AgentKind::StorageLocation, "kurator-backup-d-b".to_string()),
                (AgentKind::Backup, name.clone()),
            ],
            "storage location must be written before the backup in {}",
            cluster
        );
        let written = agent.backup(&name).unwrap();
        assert_eq!(written.metadata.labels[LABEL_BACKUP_NAME], "b");
        assert_eq!(written.metadata.labels[LABEL_FLEET], "f");
        assert_eq!(
            written.spec.storage_location.as_deref(),
            Some("kurator-backup-d-b")
        );
    }

    let stored = harness.host.backup("b").unwrap();
    assert_eq!(
        stored.metadata.finalizers,
        Some(vec![BACKUP_FINALIZER.to_string()])
    );
    let status = harness.backup_status("b");
    assert_eq!(status.phase, IntentPhase::InProgress);
    let names: Vec<&str> = status
        .details
        .iter()
        .map(|d| d.agent_object_name.as_str())
        .collect();
    assert_eq!(names, vec!["c1-backup-d-b", "c2-backup-d-b"]);
    let resolved = find_condition(&status.conditions, "DestinationResolved").unwrap();
    assert_eq!(resolved.status, ConditionStatus::True);

    // Chapter 2: one member finishes, the intent keeps waiting
    harness
        .agent("c1")
        .set_backup_phase("c1-backup-d-b", BackupPhase::Completed);
    harness.reconcile_backup("b").await.unwrap();
    let status = harness.backup_status("b");
    assert_eq!(status.phase, IntentPhase::InProgress);
    assert_eq!(
        status.details[0]
            .agent_object_status
            .as_ref()
            .and_then(|s| s.phase),
        Some(BackupPhase::Completed)
    );

    // Chapter 3: the last member finishes
    harness
        .agent("c2")
        .set_backup_phase("c2-backup-d-b", BackupPhase::Completed);
    let action = harness.reconcile_backup("b").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(harness.backup_status("b").phase, IntentPhase::Completed);

    // Chapter 4: a finished one-shot backup is left alone
    let before = harness.agent("c1").writes().len();
    let action = harness.reconcile_backup("b").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(harness.agent("c1").writes().len(), before);
}

/// Story: one member's agent fails the backup
///
/// A single failed member fails the whole one-shot intent, and the
/// completed member's detail is kept.
#[tokio::test]
async fn story_one_failed_member_fails_the_backup() {
    let harness = Harness::new("f", &["c1", "c2"]);
    harness.host.put_backup(backup("b", "f", None));
    harness.reconcile_backup("b").await.unwrap();

    harness
        .agent("c1")
        .set_backup_phase("c1-backup-d-b", BackupPhase::Completed);
    harness
        .agent("c2")
        .set_backup_phase("c2-backup-d-b", BackupPhase::PartiallyFailed);
    let action = harness.reconcile_backup("b").await.unwrap();

    assert_eq!(action, Action::await_change());
    let status = harness.backup_status("b");
    assert_eq!(status.phase, IntentPhase::Failed);
    assert_eq!(status.details.len(), 2);
}

/// Story: the backup names a fleet that does not exist yet
///
/// Nothing is written, the condition explains why, and the controller
/// checks again later instead of failing the intent.
#[tokio::test]
async fn story_missing_fleet_is_waited_for() {
    let harness = Harness::new("f", &["c1"]);
    harness.host.put_backup(backup("b", "elsewhere", None));

    let action = harness.reconcile_backup("b").await.unwrap();

    assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    assert!(harness.agent("c1").writes().is_empty());
    let status = harness.backup_status("b");
    assert_eq!(status.phase, IntentPhase::InProgress);
    let resolved = find_condition(&status.conditions, "DestinationResolved").unwrap();
    assert_eq!(resolved.status, ConditionStatus::False);
    assert_eq!(resolved.reason, "FleetNotFound");
}

/// Story: an operator schedules a recurring backup
///
/// The agents receive a Schedule instead of a Backup, and the intent
/// reports the newest backup each schedule produced.
#[tokio::test]
async fn story_recurring_backup_tracks_the_newest_scheduled_run() {
    let harness = Harness::new("f", &["c1"]);
    harness
        .host
        .put_backup(backup("nightly", "f", Some("0 2 * * *")));

    // Chapter 1: the schedule is installed and the controller sleeps until it fires
    let action = harness.reconcile_backup("nightly").await.unwrap();
    assert_eq!(
        action,
        Action::requeue(Duration::from_secs(24 * 3600) + Duration::from_secs(30))
    );
    let agent = harness.agent("c1");
    let schedule = agent.schedule("c1-backup-d-nightly").unwrap();
    assert_eq!(schedule.spec.schedule, "0 2 * * *");
    assert!(agent.backup("c1-backup-d-nightly").is_none());
    let status = harness.backup_status("nightly");
    assert_eq!(status.details.len(), 1);
    assert!(status.details[0].agent_object_status.is_none());

    // Chapter 2: two runs happened, the newer one failed
    let day = |d| Utc.with_ymd_and_hms(2024, 1, d, 2, 0, 0).unwrap();
    agent.add_backup(scheduled_backup(
        "c1-backup-d-nightly-20240101020000",
        "c1-backup-d-nightly",
        BackupPhase::Completed,
        day(1),
    ));
    agent.add_backup(scheduled_backup(
        "c1-backup-d-nightly-20240102020000",
        "c1-backup-d-nightly",
        BackupPhase::Failed,
        day(2),
    ));
    harness.reconcile_backup("nightly").await.unwrap();

    let status = harness.backup_status("nightly");
    assert_eq!(
        status.details[0]
            .agent_object_status
            .as_ref()
            .and_then(|s| s.phase),
        Some(BackupPhase::Failed)
    );
    // a recurring backup is never failed by one bad run
    assert_eq!(status.phase, IntentPhase::InProgress);

    // Chapter 3: the next run succeeds
    agent.add_backup(scheduled_backup(
        "c1-backup-d-nightly-20240103020000",
        "c1-backup-d-nightly",
        BackupPhase::Completed,
        day(3),
    ));
    harness.reconcile_backup("nightly").await.unwrap();
    assert_eq!(
        harness.backup_status("nightly").phase,
        IntentPhase::Completed
    );
}

/// Story: a schedule the cron parser rejects
#[tokio::test]
async fn story_invalid_schedule_is_rejected_without_writes() {
    let harness = Harness::new("f", &["c1"]);
    harness.host.put_backup(backup("b", "f", Some("every day")));

    let action = harness.reconcile_backup("b").await.unwrap();

    assert_eq!(action, Action::await_change());
    assert!(harness.agent("c1").writes().is_empty());
    let status = harness.backup_status("b");
    assert_eq!(status.phase, IntentPhase::Failed);
    let violation = find_condition(&status.conditions, "InvariantViolation").unwrap();
    assert_eq!(violation.status, ConditionStatus::True);
    assert_eq!(violation.reason, "InvalidSchedule");
}
