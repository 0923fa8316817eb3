//! In-memory stand-ins for the host cluster, fleets and Velero agents

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::Action;
use kube::Resource;

use kurator_backup::agent::{AgentClient, AgentKind};
use kurator_backup::fleet::{ClusterKey, FleetClusters, FleetManager};
use kurator_backup::{backup_controller, migrate_controller, restore_controller};
use kurator_backup::{Context, KubeClient};
use kurator_common::crd::{
    Backup, BackupSpec, BackupStatus, BackupStorage, ClusterRef, Destination, Fleet, FleetSpec,
    IntentKind, Migrate, MigrateSpec, MigrateStatus, Restore, RestoreSpec, RestoreStatus,
    StorageLocation,
};
use kurator_common::kube_utils::ObjectMeta;
use kurator_common::velero;
use kurator_common::{Error, VELERO_SCHEDULE_NAME_LABEL};

// =============================================================================
// Fixtures
// =============================================================================

pub const NAMESPACE: &str = "d";

fn storage() -> BackupStorage {
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

pub fn fleet(name: &str, members: &[&str]) -> Fleet {
    let mut fleet = Fleet::new(
        name,
        FleetSpec {
            clusters: members.iter().map(|m| ClusterRef::cluster(*m)).collect(),
        },
    );
    fleet.metadata.namespace = Some(NAMESPACE.to_string());
    fleet
}

pub fn backup(name: &str, fleet: &str, schedule: Option<&str>) -> Backup {
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
    backup.metadata.namespace = Some(NAMESPACE.to_string());
    backup
}

pub fn restore(name: &str, backup_name: &str, destination: Option<Destination>) -> Restore {
    let mut restore = Restore::new(
        name,
        RestoreSpec {
            backup_name: backup_name.to_string(),
            destination,
            policy: None,
            policies: vec![],
        },
    );
    restore.metadata.namespace = Some(NAMESPACE.to_string());
    restore
}

pub fn migrate(name: &str, fleet: &str, source: &str, targets: &[&str]) -> Migrate {
    let mut migrate = Migrate::new(
        name,
        MigrateSpec {
            storage: storage(),
            source_cluster: destination(fleet, &[source]),
            target_clusters: destination(fleet, targets),
            policy: None,
        },
    );
    migrate.metadata.namespace = Some(NAMESPACE.to_string());
    migrate
}

/// A backup as the Velero schedule controller would produce it
pub fn scheduled_backup(
    name: &str,
    schedule: &str,
    phase: velero::BackupPhase,
    started: DateTime<Utc>,
) -> velero::Backup {
    let labels = BTreeMap::from([(VELERO_SCHEDULE_NAME_LABEL.to_string(), schedule.to_string())]);
    let mut backup =
        velero::Backup::new(name, velero::VELERO_NAMESPACE, Default::default()).with_labels(labels);
    backup.status = Some(velero::BackupStatus {
        phase: Some(phase),
        start_timestamp: Some(started),
        ..Default::default()
    });
    backup
}

// =============================================================================
// Velero agent
// =============================================================================

#[derive(Default)]
struct AgentState {
    locations: BTreeMap<String, velero::BackupStorageLocation>,
    backups: BTreeMap<String, velero::Backup>,
    schedules: BTreeMap<String, velero::Schedule>,
    restores: BTreeMap<String, velero::Restore>,
    writes: Vec<(AgentKind, String)>,
    deletes: Vec<(AgentKind, String)>,
}

fn matches(meta: &ObjectMeta, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| meta.labels.get(k) == Some(v))
}

fn names_matching<T>(
    objects: &BTreeMap<String, T>,
    meta: impl Fn(&T) -> &ObjectMeta,
    selector: &BTreeMap<String, String>,
) -> Vec<String> {
    objects
        .iter()
        .filter(|(_, o)| matches(meta(o), selector))
        .map(|(name, _)| name.clone())
        .collect()
}

/// The Velero namespace of one member cluster.
///
/// Applies behave like server-side apply: the spec and labels are replaced
/// and any status Velero already reported is kept.
#[derive(Default)]
pub struct FakeAgent {
    state: Mutex<AgentState>,
}

impl FakeAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every apply in the order it happened
    pub fn writes(&self) -> Vec<(AgentKind, String)> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Every delete that removed an object, in order
    pub fn deletes(&self) -> Vec<(AgentKind, String)> {
        self.state.lock().unwrap().deletes.clone()
    }

    pub fn backup(&self, name: &str) -> Option<velero::Backup> {
        self.state.lock().unwrap().backups.get(name).cloned()
    }

    pub fn schedule(&self, name: &str) -> Option<velero::Schedule> {
        self.state.lock().unwrap().schedules.get(name).cloned()
    }

    pub fn restore(&self, name: &str) -> Option<velero::Restore> {
        self.state.lock().unwrap().restores.get(name).cloned()
    }

    pub fn location(&self, name: &str) -> Option<velero::BackupStorageLocation> {
        self.state.lock().unwrap().locations.get(name).cloned()
    }

    /// Names of every object in the agent namespace, of any kind
    pub fn object_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .locations
            .keys()
            .chain(state.backups.keys())
            .chain(state.schedules.keys())
            .chain(state.restores.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Insert a backup the way Velero does: replication or a schedule firing
    pub fn add_backup(&self, backup: velero::Backup) {
        self.state
            .lock()
            .unwrap()
            .backups
            .insert(backup.metadata.name.clone(), backup);
    }

    pub fn set_backup_phase(&self, name: &str, phase: velero::BackupPhase) {
        let mut state = self.state.lock().unwrap();
        let backup = state.backups.get_mut(name).unwrap();
        let status = backup.status.get_or_insert_with(Default::default);
        status.phase = Some(phase);
        status.start_timestamp.get_or_insert_with(Utc::now);
    }

    pub fn set_restore_phase(&self, name: &str, phase: velero::RestorePhase) {
        let mut state = self.state.lock().unwrap();
        let restore = state.restores.get_mut(name).unwrap();
        restore.status.get_or_insert_with(Default::default).phase = Some(phase);
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn apply_storage_location(
        &self,
        location: &velero::BackupStorageLocation,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let name = location.metadata.name.clone();
        let mut location = location.clone();
        location.status = state.locations.get(&name).and_then(|l| l.status.clone());
        state.locations.insert(name.clone(), location);
        state.writes.push((AgentKind::StorageLocation, name));
        Ok(())
    }

    async fn apply_backup(&self, backup: &velero::Backup) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let name = backup.metadata.name.clone();
        let mut backup = backup.clone();
        backup.status = state.backups.get(&name).and_then(|b| b.status.clone());
        state.backups.insert(name.clone(), backup);
        state.writes.push((AgentKind::Backup, name));
        Ok(())
    }

    async fn apply_schedule(&self, schedule: &velero::Schedule) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let name = schedule.metadata.name.clone();
        let mut schedule = schedule.clone();
        schedule.status = state.schedules.get(&name).and_then(|s| s.status.clone());
        state.schedules.insert(name.clone(), schedule);
        state.writes.push((AgentKind::Schedule, name));
        Ok(())
    }

    async fn apply_restore(&self, restore: &velero::Restore) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let name = restore.metadata.name.clone();
        let mut restore = restore.clone();
        restore.status = state.restores.get(&name).and_then(|r| r.status.clone());
        state.restores.insert(name.clone(), restore);
        state.writes.push((AgentKind::Restore, name));
        Ok(())
    }

    async fn get_backup(&self, name: &str) -> Result<Option<velero::Backup>, Error> {
        Ok(self.backup(name))
    }

    async fn get_restore(&self, name: &str) -> Result<Option<velero::Restore>, Error> {
        Ok(self.restore(name))
    }

    async fn list_backups(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<velero::Backup>, Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .backups
            .values()
            .filter(|b| matches(&b.metadata, labels))
            .cloned()
            .collect())
    }

    async fn list_names(
        &self,
        kind: AgentKind,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, Error> {
        let state = self.state.lock().unwrap();
        Ok(match kind {
            AgentKind::Backup => names_matching(&state.backups, |o| &o.metadata, labels),
            AgentKind::Schedule => names_matching(&state.schedules, |o| &o.metadata, labels),
            AgentKind::Restore => names_matching(&state.restores, |o| &o.metadata, labels),
            AgentKind::StorageLocation => names_matching(&state.locations, |o| &o.metadata, labels),
        })
    }

    async fn delete(&self, kind: AgentKind, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let removed = match kind {
            AgentKind::Backup => state.backups.remove(name).is_some(),
            AgentKind::Schedule => state.schedules.remove(name).is_some(),
            AgentKind::Restore => state.restores.remove(name).is_some(),
            AgentKind::StorageLocation => state.locations.remove(name).is_some(),
        };
        if removed {
            state.deletes.push((kind, name.to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Fleets
// =============================================================================

/// Fleets of the host cluster and the agents of their members
#[derive(Default)]
pub struct FakeFleets {
    fleets: Mutex<BTreeMap<(String, String), Fleet>>,
    agents: BTreeMap<String, Arc<FakeAgent>>,
}

impl FakeFleets {
    pub fn put_fleet(&self, fleet: Fleet) {
        let key = (
            fleet.metadata.namespace.clone().unwrap_or_default(),
            fleet.metadata.name.clone().unwrap_or_default(),
        );
        self.fleets.lock().unwrap().insert(key, fleet);
    }

    pub fn remove_fleet(&self, namespace: &str, name: &str) {
        self.fleets
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

#[async_trait]
impl FleetManager for FakeFleets {
    async fn get_fleet(&self, namespace: &str, name: &str) -> Result<Option<Fleet>, Error> {
        let fleets = self.fleets.lock().unwrap();
        Ok(fleets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn build_fleet_clusters(
        &self,
        _namespace: &str,
        members: &[ClusterRef],
    ) -> Result<FleetClusters, Error> {
        members
            .iter()
            .map(|member| {
                let agent = self
                    .agents
                    .get(&member.name)
                    .cloned()
                    .ok_or_else(|| Error::kubeconfig(&member.name, "secret not found"))?;
                Ok::<_, Error>((ClusterKey::from(member), agent as Arc<dyn AgentClient>))
            })
            .collect()
    }
}

// =============================================================================
// Host cluster
// =============================================================================

type Store<K> = Mutex<BTreeMap<String, K>>;

fn add_finalizer_to<K: Resource>(store: &Store<K>, name: &str, finalizer: &str) {
    if let Some(obj) = store.lock().unwrap().get_mut(name) {
        let finalizers = obj.meta_mut().finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == finalizer) {
            finalizers.push(finalizer.to_string());
        }
    }
}

/// Drop the finalizer; a deleting object without finalizers goes away
fn remove_finalizer_from<K: Resource>(store: &Store<K>, name: &str, finalizer: &str) {
    let mut objects = store.lock().unwrap();
    let Some(obj) = objects.get_mut(name) else {
        return;
    };
    let meta = obj.meta_mut();
    if let Some(finalizers) = meta.finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }
    let released = meta.finalizers.as_ref().map_or(true, Vec::is_empty);
    if meta.deletion_timestamp.is_some() && released {
        objects.remove(name);
    }
}

/// Mark for deletion, or delete outright if nothing holds the object
fn delete_from<K: Resource>(store: &Store<K>, name: &str) {
    let mut objects = store.lock().unwrap();
    let Some(obj) = objects.get_mut(name) else {
        return;
    };
    let meta = obj.meta_mut();
    if meta.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
        meta.deletion_timestamp = Some(Time(Utc::now()));
    } else {
        objects.remove(name);
    }
}

/// Intents stored in the single test namespace, keyed by name
#[derive(Default)]
pub struct FakeHost {
    backups: Store<Backup>,
    restores: Store<Restore>,
    migrates: Store<Migrate>,
}

impl FakeHost {
    pub fn put_backup(&self, backup: Backup) {
        let name = backup.metadata.name.clone().unwrap_or_default();
        self.backups.lock().unwrap().insert(name, backup);
    }

    pub fn put_restore(&self, restore: Restore) {
        let name = restore.metadata.name.clone().unwrap_or_default();
        self.restores.lock().unwrap().insert(name, restore);
    }

    pub fn put_migrate(&self, migrate: Migrate) {
        let name = migrate.metadata.name.clone().unwrap_or_default();
        self.migrates.lock().unwrap().insert(name, migrate);
    }

    pub fn backup(&self, name: &str) -> Option<Backup> {
        self.backups.lock().unwrap().get(name).cloned()
    }

    pub fn restore(&self, name: &str) -> Option<Restore> {
        self.restores.lock().unwrap().get(name).cloned()
    }

    pub fn migrate(&self, name: &str) -> Option<Migrate> {
        self.migrates.lock().unwrap().get(name).cloned()
    }

    pub fn delete_backup(&self, name: &str) {
        delete_from(&self.backups, name);
    }

    pub fn delete_restore(&self, name: &str) {
        delete_from(&self.restores, name);
    }

    pub fn delete_migrate(&self, name: &str) {
        delete_from(&self.migrates, name);
    }
}

#[async_trait]
impl KubeClient for FakeHost {
    async fn get_backup(&self, _namespace: &str, name: &str) -> Result<Option<Backup>, Error> {
        Ok(self.backup(name))
    }

    async fn patch_backup_status(
        &self,
        _namespace: &str,
        name: &str,
        status: &BackupStatus,
    ) -> Result<(), Error> {
        if let Some(backup) = self.backups.lock().unwrap().get_mut(name) {
            backup.status = Some(status.clone());
        }
        Ok(())
    }

    async fn patch_restore_status(
        &self,
        _namespace: &str,
        name: &str,
        status: &RestoreStatus,
    ) -> Result<(), Error> {
        if let Some(restore) = self.restores.lock().unwrap().get_mut(name) {
            restore.status = Some(status.clone());
        }
        Ok(())
    }

    async fn patch_migrate_status(
        &self,
        _namespace: &str,
        name: &str,
        status: &MigrateStatus,
    ) -> Result<(), Error> {
        if let Some(migrate) = self.migrates.lock().unwrap().get_mut(name) {
            migrate.status = Some(status.clone());
        }
        Ok(())
    }

    async fn add_finalizer(
        &self,
        kind: IntentKind,
        _namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        match kind {
            IntentKind::Backup => add_finalizer_to(&self.backups, name, kind.finalizer()),
            IntentKind::Restore => add_finalizer_to(&self.restores, name, kind.finalizer()),
            IntentKind::Migrate => add_finalizer_to(&self.migrates, name, kind.finalizer()),
        }
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        kind: IntentKind,
        _namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        match kind {
            IntentKind::Backup => remove_finalizer_from(&self.backups, name, kind.finalizer()),
            IntentKind::Restore => remove_finalizer_from(&self.restores, name, kind.finalizer()),
            IntentKind::Migrate => remove_finalizer_from(&self.migrates, name, kind.finalizer()),
        }
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A host cluster with one fleet whose members each run a fake agent
pub struct Harness {
    pub host: Arc<FakeHost>,
    pub fleets: Arc<FakeFleets>,
    pub agents: BTreeMap<String, Arc<FakeAgent>>,
    ctx: Arc<Context>,
}

impl Harness {
    pub fn new(fleet_name: &str, members: &[&str]) -> Self {
        let agents: BTreeMap<String, Arc<FakeAgent>> = members
            .iter()
            .map(|m| (m.to_string(), FakeAgent::new()))
            .collect();
        let fleets = Arc::new(FakeFleets {
            fleets: Mutex::default(),
            agents: agents.clone(),
        });
        fleets.put_fleet(fleet(fleet_name, members));
        let host = Arc::new(FakeHost::default());
        let ctx = Arc::new(Context::new(host.clone(), fleets.clone()));
        Self {
            host,
            fleets,
            agents,
            ctx,
        }
    }

    pub fn agent(&self, cluster: &str) -> &FakeAgent {
        &self.agents[cluster]
    }

    pub async fn reconcile_backup(&self, name: &str) -> Result<Action, Error> {
        let backup = self.host.backup(name).expect("backup exists");
        backup_controller::reconcile(Arc::new(backup), self.ctx.clone()).await
    }

    pub async fn reconcile_restore(&self, name: &str) -> Result<Action, Error> {
        let restore = self.host.restore(name).expect("restore exists");
        restore_controller::reconcile(Arc::new(restore), self.ctx.clone()).await
    }

    pub async fn reconcile_migrate(&self, name: &str) -> Result<Action, Error> {
        let migrate = self.host.migrate(name).expect("migrate exists");
        migrate_controller::reconcile(Arc::new(migrate), self.ctx.clone()).await
    }

    /// Create a one-shot backup of every member and drive it to Completed
    pub async fn completed_backup(&self, name: &str, fleet: &str) {
        self.host.put_backup(backup(name, fleet, None));
        self.reconcile_backup(name).await.unwrap();
        for (cluster, agent) in &self.agents {
            agent.set_backup_phase(
                &format!("{}-backup-{}-{}", cluster, NAMESPACE, name),
                velero::BackupPhase::Completed,
            );
        }
        self.reconcile_backup(name).await.unwrap();
    }

    pub fn backup_status(&self, name: &str) -> BackupStatus {
        self.host
            .backup(name)
            .and_then(|b| b.status)
            .unwrap_or_default()
    }

    pub fn restore_status(&self, name: &str) -> RestoreStatus {
        self.host
            .restore(name)
            .and_then(|r| r.status)
            .unwrap_or_default()
    }

    pub fn migrate_status(&self, name: &str) -> MigrateStatus {
        self.host
            .migrate(name)
            .and_then(|m| m.status)
            .unwrap_or_default()
    }
}
