//! Translation of intent specs into Velero objects
//!
//! Everything here is pure: equal inputs produce equal objects, and maps are
//! ordered so serialized payloads are byte-identical across reconciles.

use std::collections::BTreeMap;

use kurator_common::crd::{
    BackupPolicy, BackupStorage, IntentKind, MigratePolicy, PreserveStatus, ResourceFilter,
    RestorePolicy, RestoreResourceFilter,
};
use kurator_common::velero::{self, VELERO_NAMESPACE};
use kurator_common::{LABEL_FLEET, LABEL_PLUGIN_NAME, PLUGIN_NAME_BACKUP};

/// Name of the agent object an intent owns in one member cluster:
/// `{cluster}-{kind}-{namespace}-{name}`, plus `-{policy}` for objects of a
/// named backup policy
pub fn agent_object_name(
    cluster: &str,
    kind: IntentKind,
    namespace: &str,
    name: &str,
    policy: Option<&str>,
) -> String {
    match policy {
        Some(policy) => format!("{}-{}-{}-{}-{}", cluster, kind, namespace, name, policy),
        None => format!("{}-{}-{}-{}", cluster, kind, namespace, name),
    }
}

/// Name of the storage location an intent writes into every member cluster
pub fn storage_location_name(kind: IntentKind, namespace: &str, name: &str) -> String {
    format!("kurator-{}-{}-{}", kind, namespace, name)
}

/// The three labels identifying an agent object's owner
pub fn agent_labels(kind: IntentKind, intent_name: &str, fleet: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (kind.creator_label().to_string(), intent_name.to_string()),
        (LABEL_FLEET.to_string(), fleet.to_string()),
        (
            LABEL_PLUGIN_NAME.to_string(),
            PLUGIN_NAME_BACKUP.to_string(),
        ),
    ])
}

/// Build the storage location an intent's backups are written to.
///
/// `s3Url` implies path-style addressing, which S3-compatible stores such as
/// MinIO require. The credential must exist in the agent namespace.
pub fn build_storage_location(
    name: &str,
    labels: BTreeMap<String, String>,
    storage: &BackupStorage,
) -> velero::BackupStorageLocation {
    let location = &storage.location;
    let mut config = location.config.clone();
    if let Some(region) = &location.region {
        config.insert("region".to_string(), region.clone());
    }
    if let Some(url) = &location.s3_url {
        config.insert("s3Url".to_string(), url.clone());
        config.insert("s3ForcePathStyle".to_string(), "true".to_string());
    }

    velero::BackupStorageLocation::new(
        name,
        VELERO_NAMESPACE,
        velero::BackupStorageLocationSpec {
            provider: location.provider.clone(),
            object_storage: velero::ObjectStorageLocation {
                bucket: location.bucket.clone(),
                prefix: location.prefix.clone(),
            },
            config,
            credential: Some(velero::VeleroCredential {
                name: storage.secret_name.clone(),
                key: "cloud".to_string(),
            }),
        },
    )
    .with_labels(labels)
}

fn filtered_backup_spec(filter: Option<&ResourceFilter>) -> velero::BackupSpec {
    let Some(f) = filter else {
        return velero::BackupSpec::default();
    };
    velero::BackupSpec {
        included_namespaces: f.included_namespaces.clone(),
        excluded_namespaces: f.excluded_namespaces.clone(),
        included_resources: f.included_resources.clone(),
        excluded_resources: f.excluded_resources.clone(),
        include_cluster_resources: f.include_cluster_resources,
        included_cluster_scoped_resources: f.included_cluster_scoped_resources.clone(),
        excluded_cluster_scoped_resources: f.excluded_cluster_scoped_resources.clone(),
        included_namespace_scoped_resources: f.included_namespace_scoped_resources.clone(),
        excluded_namespace_scoped_resources: f.excluded_namespace_scoped_resources.clone(),
        label_selector: f.label_selector.clone(),
        or_label_selectors: f.or_label_selectors.clone(),
        ..Default::default()
    }
}

fn backup_spec(policy: Option<&BackupPolicy>, storage_location: &str) -> velero::BackupSpec {
    let mut spec = filtered_backup_spec(policy.and_then(|p| p.resource_filter.as_ref()));
    if let Some(policy) = policy {
        spec.ttl = policy.ttl.clone();
        spec.ordered_resources = policy.ordered_resources.clone();
        spec.item_operation_timeout = policy.item_operation_timeout.clone();
    }
    spec.storage_location = Some(storage_location.to_string());
    spec
}

/// Build a one-shot agent backup
pub fn build_backup(
    name: &str,
    labels: BTreeMap<String, String>,
    policy: Option<&BackupPolicy>,
    storage_location: &str,
) -> velero::Backup {
    velero::Backup::new(
        name,
        VELERO_NAMESPACE,
        backup_spec(policy, storage_location),
    )
    .with_labels(labels)
}

/// Build a recurring agent backup; the backup spec becomes the template
pub fn build_schedule(
    name: &str,
    labels: BTreeMap<String, String>,
    cron: &str,
    policy: Option<&BackupPolicy>,
    storage_location: &str,
) -> velero::Schedule {
    velero::Schedule::new(
        name,
        VELERO_NAMESPACE,
        velero::ScheduleSpec {
            schedule: cron.to_string(),
            paused: None,
            template: backup_spec(policy, storage_location),
        },
    )
    .with_labels(labels)
}

fn restore_status_spec(preserve: Option<&PreserveStatus>) -> Option<velero::RestoreStatusSpec> {
    preserve.map(|p| velero::RestoreStatusSpec {
        included_resources: p.included_resources.clone(),
        excluded_resources: p.excluded_resources.clone(),
    })
}

fn filtered_restore_spec(
    backup_name: &str,
    filter: Option<&RestoreResourceFilter>,
) -> velero::RestoreSpec {
    let mut spec = velero::RestoreSpec {
        backup_name: backup_name.to_string(),
        ..Default::default()
    };
    if let Some(f) = filter {
        spec.included_namespaces = f.included_namespaces.clone();
        spec.excluded_namespaces = f.excluded_namespaces.clone();
        spec.included_resources = f.included_resources.clone();
        spec.excluded_resources = f.excluded_resources.clone();
        spec.include_cluster_resources = f.include_cluster_resources;
        spec.label_selector = f.label_selector.clone();
        spec.or_label_selectors = f.or_label_selectors.clone();
    }
    spec
}

/// Build an agent restore of `backup_name`
pub fn build_restore(
    name: &str,
    labels: BTreeMap<String, String>,
    backup_name: &str,
    policy: Option<&RestorePolicy>,
) -> velero::Restore {
    let filter = policy.and_then(|p| p.resource_filter.as_ref());
    let mut spec = filtered_restore_spec(backup_name, filter);
    if let Some(policy) = policy {
        spec.namespace_mapping = policy.namespace_mapping.clone();
        spec.preserve_node_ports = policy.preserve_node_ports;
        spec.restore_status = restore_status_spec(policy.preserve_status.as_ref());
    }
    velero::Restore::new(name, VELERO_NAMESPACE, spec).with_labels(labels)
}

/// Build the source-cluster backup of a migration.
///
/// Only the resource filter and ordering carry over; a migration backup has
/// no retention or plugin timeout of its own.
pub fn build_migrate_backup(
    name: &str,
    labels: BTreeMap<String, String>,
    policy: Option<&MigratePolicy>,
    storage_location: &str,
) -> velero::Backup {
    let mut spec = filtered_backup_spec(policy.and_then(|p| p.resource_filter.as_ref()));
    if let Some(policy) = policy {
        spec.ordered_resources = policy.ordered_resources.clone();
    }
    spec.storage_location = Some(storage_location.to_string());
    velero::Backup::new(name, VELERO_NAMESPACE, spec).with_labels(labels)
}

/// Build a target-cluster restore of a migration
pub fn build_migrate_restore(
    name: &str,
    labels: BTreeMap<String, String>,
    backup_name: &str,
    policy: Option<&MigratePolicy>,
) -> velero::Restore {
    let mut spec = filtered_restore_spec(backup_name, None);
    if let Some(policy) = policy {
        spec.namespace_mapping = policy.namespace_mapping.clone();
        spec.preserve_node_ports = policy.preserve_node_ports;
        spec.restore_status = restore_status_spec(policy.preserve_status.as_ref());
    }
    velero::Restore::new(name, VELERO_NAMESPACE, spec).with_labels(labels)
}
