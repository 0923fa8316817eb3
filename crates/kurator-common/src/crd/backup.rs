//! Backup Custom Resource Definition
//!
//! A Backup declares that a set of fleet members should be backed up, either
//! once or on a cron schedule. Each selected cluster gets one Velero Backup
//! (one-shot) or Schedule (recurring) per backup policy.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    parse_duration, validate_ordered_resources, validate_ttl, BackupStorage, ClusterDetail,
    Condition, Destination, IntentPhase, ResourceFilter,
};
use crate::{velero, Error};

/// Specification for a Backup
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "backup.kurator.dev",
    version = "v1alpha1",
    kind = "Backup",
    plural = "backups",
    namespaced,
    status = "BackupStatus",
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Object storage the agents write to
    pub storage: BackupStorage,

    /// Cron expression; absent means a one-shot backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Clusters to back up
    pub destination: Destination,

    /// What to back up when no named policies are given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<BackupPolicy>,

    /// Independent backup policies, each fanned out on its own
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<BackupSyncPolicy>,
}

/// What a backup captures and how long it is kept
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicy {
    /// Resource selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_filter: Option<ResourceFilter>,

    /// Retention as a Go duration (e.g. "720h")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,

    /// Per-kind ordered `namespace/name` lists backed up in that order
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ordered_resources: BTreeMap<String, String>,

    /// Timeout for asynchronous plugin operations (Go duration)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_operation_timeout: Option<String>,
}

impl BackupPolicy {
    fn validate(&self, field: &str) -> Result<(), Error> {
        validate_ttl(self.ttl.as_deref(), &format!("{}.ttl", field))?;
        validate_ordered_resources(
            &self.ordered_resources,
            &format!("{}.orderedResources", field),
        )?;
        if let Some(timeout) = &self.item_operation_timeout {
            let field = format!("{}.itemOperationTimeout", field);
            parse_duration(timeout)
                .map_err(|e| Error::validation_for_field(field, e.to_string()))?;
        }
        Ok(())
    }
}

/// A named backup policy with an optional destination override
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSyncPolicy {
    /// Name restores use to refer to this policy's backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Clusters for this policy; defaults to the backup's destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Destination>,

    /// The policy itself
    #[serde(default)]
    pub policy: BackupPolicy,
}

/// One independently fanned-out part of a Backup
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PolicyUnit<'a> {
    /// Policy name, `None` for the default policy
    pub name: Option<&'a str>,
    /// Clusters this unit targets
    pub destination: &'a Destination,
    /// Backup policy, `None` backs up everything
    pub policy: Option<&'a BackupPolicy>,
}

impl BackupSpec {
    /// Whether this backup runs on a schedule
    pub fn is_recurring(&self) -> bool {
        self.schedule
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }

    /// The policy units this backup fans out.
    ///
    /// Without named policies there is exactly one unnamed unit built from
    /// `destination` and `policy`. Otherwise every entry of `policies` is a
    /// unit, falling back to `destination` when it has none of its own.
    pub fn policy_units(&self) -> Vec<PolicyUnit<'_>> {
        if self.policies.is_empty() {
            return vec![PolicyUnit {
                name: None,
                destination: &self.destination,
                policy: self.policy.as_ref(),
            }];
        }
        self.policies
            .iter()
            .map(|p| PolicyUnit {
                name: p.name.as_deref(),
                destination: p.destination.as_ref().unwrap_or(&self.destination),
                policy: Some(&p.policy),
            })
            .collect()
    }

    /// Find the unit a restore policy name refers to
    pub fn policy_unit(&self, name: Option<&str>) -> Option<PolicyUnit<'_>> {
        self.policy_units().into_iter().find(|u| u.name == name)
    }

    /// Time between two adjacent fires of the schedule, if recurring
    pub fn schedule_interval(&self, now: DateTime<Utc>) -> Result<Option<Duration>, Error> {
        match self.schedule.as_deref() {
            Some(expr) if self.is_recurring() => cron_interval(expr, now).map(Some),
            _ => Ok(None),
        }
    }

    /// Validate the backup specification
    pub fn validate(&self) -> Result<(), Error> {
        if self.destination.fleet.trim().is_empty() {
            return Err(Error::validation_for_field(
                "spec.destination.fleet",
                "fleet must not be empty",
            ));
        }
        if self.storage.location.bucket.trim().is_empty() {
            return Err(Error::validation_for_field(
                "spec.storage.location.bucket",
                "bucket must not be empty",
            ));
        }
        if self.storage.location.provider.trim().is_empty() {
            return Err(Error::validation_for_field(
                "spec.storage.location.provider",
                "provider must not be empty",
            ));
        }

        if let Some(expr) = self.schedule.as_deref().filter(|_| self.is_recurring()) {
            parse_cron(expr)?;
        }

        if let Some(policy) = &self.policy {
            policy.validate("spec.policy")?;
        }

        let mut names = HashSet::new();
        for (i, sync) in self.policies.iter().enumerate() {
            let field = format!("spec.policies[{}]", i);
            if !names.insert(sync.name.as_deref()) {
                return Err(Error::validation_for_field(
                    format!("{}.name", field),
                    match &sync.name {
                        Some(name) => format!("duplicate policy name {:?}", name),
                        None => "only one policy may be unnamed".to_string(),
                    },
                ));
            }
            if let Some(name) = &sync.name {
                if name.is_empty() || name.contains('/') {
                    return Err(Error::validation_for_field(
                        format!("{}.name", field),
                        format!("invalid policy name {:?}", name),
                    ));
                }
            }
            sync.policy.validate(&format!("{}.policy", field))?;
        }
        Ok(())
    }
}

/// Parse a standard five-field cron expression
pub fn parse_cron(expression: &str) -> Result<Cron, Error> {
    Cron::new(expression).parse().map_err(|e| Error::Cron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// Interval between the next two fires of a cron expression after `now`
pub fn cron_interval(expression: &str, now: DateTime<Utc>) -> Result<Duration, Error> {
    let cron = parse_cron(expression)?;
    let cron_err = |e: croner::errors::CronError| Error::Cron {
        expression: expression.to_string(),
        message: e.to_string(),
    };
    let first = cron.find_next_occurrence(&now, false).map_err(cron_err)?;
    let second = cron.find_next_occurrence(&first, false).map_err(cron_err)?;
    (second - first).to_std().map_err(|e| Error::Cron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

/// Per-cluster detail of a Backup
pub type BackupDetail = ClusterDetail<velero::BackupStatus>;

/// Status of a Backup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// Current phase
    #[serde(default)]
    pub phase: IntentPhase,

    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// One entry per agent object, in creation order
    #[serde(default)]
    pub details: Vec<BackupDetail>,
}
