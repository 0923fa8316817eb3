//! Shared types used across the Kurator backup CRDs

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::velero::LabelSelector;
use crate::{
    Error, BACKUP_FINALIZER, LABEL_BACKUP_NAME, LABEL_MIGRATE_NAME, LABEL_RESTORE_NAME,
    MIGRATE_FINALIZER, RESTORE_FINALIZER,
};

// =============================================================================
// Intents
// =============================================================================

/// The three kinds of user intent the operator reconciles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntentKind {
    /// Backup intent
    Backup,
    /// Restore intent
    Restore,
    /// Migrate intent
    Migrate,
}

impl IntentKind {
    /// Lowercase name used in agent object names
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Migrate => "migrate",
        }
    }

    /// Label key carrying the creating intent's name
    pub fn creator_label(&self) -> &'static str {
        match self {
            Self::Backup => LABEL_BACKUP_NAME,
            Self::Restore => LABEL_RESTORE_NAME,
            Self::Migrate => LABEL_MIGRATE_NAME,
        }
    }

    /// Finalizer guarding intents of this kind
    pub fn finalizer(&self) -> &'static str {
        match self {
            Self::Backup => BACKUP_FINALIZER,
            Self::Restore => RESTORE_FINALIZER,
            Self::Migrate => MIGRATE_FINALIZER,
        }
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase shared by Backup and Restore intents
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum IntentPhase {
    /// Not yet reconciled
    #[default]
    Pending,
    /// Agent objects exist and are running
    InProgress,
    /// Every agent object completed
    Completed,
    /// An agent object failed or the intent is invalid
    Failed,
}

impl IntentPhase {
    /// Completed or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for IntentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Destinations
// =============================================================================

/// Provenance of a member cluster
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Serialize,
    JsonSchema,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
pub enum ClusterKind {
    /// A Cluster API cluster
    #[default]
    Cluster,
    /// A cluster attached through its kubeconfig
    AttachedCluster,
}

impl std::fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cluster => write!(f, "Cluster"),
            Self::AttachedCluster => write!(f, "AttachedCluster"),
        }
    }
}

/// Reference to one member cluster
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRef {
    /// Cluster name
    pub name: String,
    /// Cluster provenance
    #[serde(default)]
    pub kind: ClusterKind,
}

impl ClusterRef {
    /// Reference a Cluster API cluster
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ClusterKind::Cluster,
        }
    }

    /// Reference an attached cluster
    pub fn attached(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ClusterKind::AttachedCluster,
        }
    }
}

impl std::fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Selection of member clusters within a fleet
///
/// An empty `clusters` list selects every member of the fleet.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Fleet in the intent's namespace
    pub fleet: String,
    /// Subset of the fleet's members
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterRef>,
}

// =============================================================================
// Storage
// =============================================================================

/// Object storage the agents write backups to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorage {
    /// Where backups are stored
    pub location: StorageLocation,
    /// Secret (in the agent namespace) holding the object store credentials
    pub secret_name: String,
}

/// Bucket location of a backup storage
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageLocation {
    /// Bucket name
    pub bucket: String,
    /// Object store provider (aws, gcp, azure)
    pub provider: String,
    /// S3-compatible endpoint, e.g. a MinIO or OBS URL
    #[serde(default, rename = "s3Url", skip_serializing_if = "Option::is_none")]
    pub s3_url: Option<String>,
    /// Bucket region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Prefix within the bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Extra provider configuration passed through verbatim
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

// =============================================================================
// Resource filters
// =============================================================================

/// Selects which resources a backup captures
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFilter {
    /// Included namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespaces: Vec<String>,
    /// Excluded namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_namespaces: Vec<String>,
    /// Included resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_resources: Vec<String>,
    /// Excluded resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,
    /// Whether cluster-scoped resources are included
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_cluster_resources: Option<bool>,
    /// Included cluster-scoped resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_cluster_scoped_resources: Vec<String>,
    /// Excluded cluster-scoped resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_cluster_scoped_resources: Vec<String>,
    /// Included namespace-scoped resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespace_scoped_resources: Vec<String>,
    /// Excluded namespace-scoped resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_namespace_scoped_resources: Vec<String>,
    /// Label selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    /// Selectors OR-ed together
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub or_label_selectors: Vec<LabelSelector>,
}

/// Selects which backed-up resources a restore applies
///
/// Velero restores do not accept scoped-resource filters, so this is the
/// subset of [`ResourceFilter`] that carries over.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResourceFilter {
    /// Included namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespaces: Vec<String>,
    /// Excluded namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_namespaces: Vec<String>,
    /// Included resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_resources: Vec<String>,
    /// Excluded resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,
    /// Whether cluster-scoped resources are restored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_cluster_resources: Option<bool>,
    /// Label selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    /// Selectors OR-ed together
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub or_label_selectors: Vec<LabelSelector>,
}

/// Resources whose `.status` is restored
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreserveStatus {
    /// Included resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_resources: Vec<String>,
    /// Excluded resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., SourceReady, InvariantViolation)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Insert or replace the condition of the same type.
///
/// An unchanged condition keeps its original transition time so that
/// re-applying it leaves the status byte-identical.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status
                || existing.reason != condition.reason
                || existing.message != condition.message
            {
                *existing = condition;
            }
        }
        None => conditions.push(condition),
    }
}

/// Remove the condition of the given type, if present
pub fn clear_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Look up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Per-cluster record of the agent object an intent created
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDetail<S> {
    /// Member cluster name
    pub cluster_name: String,
    /// Member cluster provenance
    pub cluster_kind: ClusterKind,
    /// Name of the agent object in the cluster's agent namespace
    pub agent_object_name: String,
    /// Last status observed on the agent object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_object_status: Option<S>,
}

// =============================================================================
// Validation helpers
// =============================================================================

/// Parse a Go-style duration string ("720h", "1h30m", "90s", "500ms")
pub fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = |msg: &str| Error::validation(format!("invalid duration {:?}: {}", input, msg));

    let s = input.trim();
    if s.is_empty() {
        return Err(invalid("empty"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| invalid("missing unit"))?;
        if digits == 0 {
            return Err(invalid("expected a number"));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| invalid("malformed number"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => return Err(invalid(&format!("unknown unit {:?}", other))),
        };
        rest = &rest[unit_len..];
        total += Duration::from_secs_f64(value * seconds_per_unit);
    }
    Ok(total)
}

/// Validate an `orderedResources` map: each value is a comma-separated list
/// of `namespace/name` (or `name` for cluster-scoped kinds)
pub fn validate_ordered_resources(
    ordered: &BTreeMap<String, String>,
    field: &str,
) -> Result<(), Error> {
    for (kind, list) in ordered {
        if kind.trim().is_empty() {
            return Err(Error::validation_for_field(field, "resource kind must not be empty"));
        }
        for item in list.split(',').map(str::trim) {
            let valid = match item.split_once('/') {
                Some((ns, name)) => !ns.is_empty() && !name.is_empty() && !name.contains('/'),
                None => !item.is_empty(),
            };
            if !valid {
                return Err(Error::validation_for_field(
                    format!("{}[{}]", field, kind),
                    format!("{:?} is not a namespace/name entry", item),
                ));
            }
        }
    }
    Ok(())
}

/// Validate that an optional TTL is a positive duration
pub fn validate_ttl(ttl: Option<&str>, field: &str) -> Result<(), Error> {
    if let Some(ttl) = ttl {
        let parsed = parse_duration(ttl)
            .map_err(|e| Error::validation_for_field(field, e.to_string()))?;
        if parsed.is_zero() {
            return Err(Error::validation_for_field(field, "ttl must be greater than zero"));
        }
    }
    Ok(())
}
