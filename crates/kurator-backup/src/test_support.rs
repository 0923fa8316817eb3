//! Fixtures shared by the controller unit tests

use std::sync::{Arc, Mutex};

use kurator_common::crd::{
    Backup, BackupSpec, BackupStorage, ClusterRef, Destination, Fleet, FleetSpec, Migrate,
    MigrateSpec, Restore, RestoreSpec, StorageLocation,
};

use crate::agent::AgentClient;
use crate::context::MockKubeClient;
use crate::fleet::{ClusterKey, FleetClusters, MockFleetManager};

pub fn storage() -> BackupStorage {
    BackupStorage {
        location: StorageLocation {
            bucket: "kurator-backups".to_string(),
            provider: "aws".to_string(),
            s3_url: Some("http://minio.kurator-system:9000".to_string()),
            region: Some("minio".to_string()),
            ..Default::default()
        },
        secret_name: "backup-creds".to_string(),
    }
}

pub fn destination(fleet: &str, clusters: &[&str]) -> Destination {
    Destination {
        fleet: fleet.to_string(),
        clusters: clusters.iter().map(|c| ClusterRef::cluster(*c)).collect(),
    }
}

pub fn backup(namespace: &str, name: &str, fleet: &str, schedule: Option<&str>) -> Backup {
    let mut backup = Backup::new(
        name,
        BackupSpec {
            storage: storage(),
            schedule: schedule.map(str::to_string),
            destination: destination(fleet, &[]),
            policy: None,
            policies: vec![],
        },
    );
    backup.metadata.namespace = Some(namespace.to_string());
    backup
}

pub fn restore(
    namespace: &str,
    name: &str,
    backup_name: &str,
    destination: Option<Destination>,
) -> Restore {
    let mut restore = Restore::new(
        name,
        RestoreSpec {
            backup_name: backup_name.to_string(),
            destination,
            policy: None,
            policies: vec![],
        },
    );
    restore.metadata.namespace = Some(namespace.to_string());
    restore
}

pub fn migrate(namespace: &str, name: &str, source: &str, targets: &[&str]) -> Migrate {
    let mut migrate = Migrate::new(
        name,
        MigrateSpec {
            storage: storage(),
            source_cluster: destination("quickstart", &[source]),
            target_clusters: destination("quickstart", targets),
            policy: None,
        },
    );
    migrate.metadata.namespace = Some(namespace.to_string());
    migrate
}

pub fn fleet(name: &str, members: &[&str]) -> Fleet {
    Fleet::new(
        name,
        FleetSpec {
            clusters: members.iter().map(|m| ClusterRef::cluster(*m)).collect(),
        },
    )
}

/// A fleet manager serving one fleet whose members use the given clients
pub fn fleet_manager(fleet: Fleet, clients: Vec<(&str, Arc<dyn AgentClient>)>) -> MockFleetManager {
    let clients: Vec<(ClusterKey, Arc<dyn AgentClient>)> = clients
        .into_iter()
        .map(|(name, client)| (ClusterKey::from(&ClusterRef::cluster(name)), client))
        .collect();
    let fleet_name = fleet.metadata.name.clone().unwrap_or_default();

    let mut manager = MockFleetManager::new();
    manager
        .expect_get_fleet()
        .returning(move |_, name| Ok((name == fleet_name).then(|| fleet.clone())));
    manager
        .expect_build_fleet_clusters()
        .returning(move |_, members| {
            Ok(members
                .iter()
                .filter_map(|m| {
                    let key = ClusterKey::from(m);
                    clients
                        .iter()
                        .find(|(k, _)| *k == key)
                        .map(|(k, c)| (k.clone(), c.clone()))
                })
                .collect::<FleetClusters>())
        });
    manager
}

/// Host client recording every status patch and finalizer change
pub struct HostRecorder<S> {
    pub statuses: Arc<Mutex<Vec<S>>>,
}

impl<S> HostRecorder<S> {
    pub fn last(&self) -> Option<S>
    where
        S: Clone,
    {
        self.statuses.lock().unwrap().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.statuses.lock().unwrap().len()
    }
}

macro_rules! recorder {
    ($fn_name:ident, $status:ty, $expect:ident) => {
        pub fn $fn_name(kube: &mut MockKubeClient) -> HostRecorder<$status> {
            let statuses = Arc::new(Mutex::new(Vec::new()));
            let sink = statuses.clone();
            kube.$expect().returning(move |_, _, status| {
                sink.lock().unwrap().push(status.clone());
                Ok(())
            });
            kube.expect_add_finalizer().returning(|_, _, _| Ok(()));
            HostRecorder { statuses }
        }
    };
}

recorder!(
    record_backup_status,
    kurator_common::crd::BackupStatus,
    expect_patch_backup_status
);
recorder!(
    record_restore_status,
    kurator_common::crd::RestoreStatus,
    expect_patch_restore_status
);
recorder!(
    record_migrate_status,
    kurator_common::crd::MigrateStatus,
    expect_patch_migrate_status
);
