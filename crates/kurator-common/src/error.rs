//! Error types for the Kurator backup operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the fleet, cluster, or intent it relates to so a
//! reconciler can both log it and turn it into a status condition.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Kurator backup operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The Fleet named by a destination does not exist
    #[error("fleet {namespace}/{fleet} not found")]
    FleetNotFound {
        /// Namespace the fleet was looked up in
        namespace: String,
        /// Name of the missing fleet
        fleet: String,
    },

    /// A destination names a cluster the fleet does not contain
    #[error("cluster {kind}/{cluster} is not a member of fleet {fleet}")]
    MemberMissing {
        /// Fleet that was searched
        fleet: String,
        /// Name of the requested cluster
        cluster: String,
        /// Kind of the requested cluster (Cluster, AttachedCluster)
        kind: String,
    },

    /// A cross-object invariant does not hold (e.g. restore outside its backup's clusters)
    #[error("invariant violation for {intent}: {message}")]
    InvariantViolation {
        /// The intent (namespace/name) violating the invariant
        intent: String,
        /// Description of the violation
        message: String,
    },

    /// A Restore or Migrate refers to a Backup that does not exist
    #[error("backup {namespace}/{name} not found")]
    BackupNotFound {
        /// Namespace of the referred backup
        namespace: String,
        /// Name of the referred backup
        name: String,
    },

    /// A schedule has not produced any completed backup yet
    #[error("no completed backups for schedule {schedule} in cluster {cluster}")]
    NoCompletedBackups {
        /// Cluster that was searched
        cluster: String,
        /// Schedule whose backups were searched
        schedule: String,
    },

    /// An operation against one member cluster failed
    #[error("cluster {cluster}: {source}")]
    ClusterOperation {
        /// Member cluster the operation targeted
        cluster: String,
        /// What went wrong there
        source: Box<Error>,
    },

    /// Some member clusters failed while others succeeded
    #[error("{} cluster operation(s) failed: {}", .failures.len(), summarize(.failures))]
    PartialClusterFailure {
        /// One entry per failed cluster
        failures: Vec<Error>,
    },

    /// Cron expression could not be parsed or evaluated
    #[error("invalid cron expression {expression:?}: {message}")]
    Cron {
        /// The offending expression
        expression: String,
        /// Parser message
        message: String,
    },

    /// Validation error for CRD specs
    #[error("validation error for {intent}: {message}")]
    Validation {
        /// Name of the intent with invalid configuration
        intent: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.policy.ttl")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// A member cluster's kubeconfig could not be loaded
    #[error("kubeconfig error for {cluster}: {message}")]
    Kubeconfig {
        /// Cluster whose kubeconfig is broken
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "controller")
        context: String,
    },
}

fn summarize(failures: &[Error]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            intent: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with a field path
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            intent: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Attach the intent name to a validation error
    pub fn for_intent(self, intent: impl Into<String>) -> Self {
        match self {
            Self::Validation { message, field, .. } => Self::Validation {
                intent: intent.into(),
                message,
                field,
            },
            other => other,
        }
    }

    /// Create an invariant violation for the given intent
    pub fn invariant(intent: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvariantViolation {
            intent: intent.into(),
            message: msg.into(),
        }
    }

    /// Wrap an error with the member cluster it happened on
    pub fn on_cluster(cluster: impl Into<String>, source: Error) -> Self {
        Self::ClusterOperation {
            cluster: cluster.into(),
            source: Box::new(source),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a kubeconfig error for a member cluster
    pub fn kubeconfig(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Kubeconfig {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Collapse per-cluster failures into a single error.
    ///
    /// Returns `None` when nothing failed; a single failure is returned as-is.
    pub fn from_failures(mut failures: Vec<Error>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop(),
            _ => Some(Self::PartialClusterFailure { failures }),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, invariant and cron errors require a user fix. Kubernetes 4xx
    /// responses (forbidden, invalid) are permanent except conflicts and
    /// throttling. A partial failure is retryable if any part of it is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae)
                    if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::FleetNotFound { .. } => true,
            Error::MemberMissing { .. } => true,
            Error::InvariantViolation { .. } => false,
            Error::BackupNotFound { .. } => false,
            Error::NoCompletedBackups { .. } => false,
            Error::ClusterOperation { source, .. } => source.is_retryable(),
            Error::PartialClusterFailure { failures } => failures.iter().any(Error::is_retryable),
            Error::Cron { .. } => false,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Kubeconfig { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Machine-readable reason used when this error is surfaced as a condition
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "KubernetesError",
            Error::FleetNotFound { .. } => "FleetNotFound",
            Error::MemberMissing { .. } => "MemberMissing",
            Error::InvariantViolation { .. } => "InvariantViolation",
            Error::BackupNotFound { .. } => "BackupNotFound",
            Error::NoCompletedBackups { .. } => "NoCompletedBackups",
            Error::ClusterOperation { source, .. } => source.reason(),
            Error::PartialClusterFailure { .. } => "PartialClusterFailure",
            Error::Cron { .. } => "InvalidSchedule",
            Error::Validation { .. } => "InvalidSpec",
            Error::Serialization { .. } => "SerializationError",
            Error::Kubeconfig { .. } => "KubeconfigError",
            Error::Internal { .. } => "InternalError",
        }
    }

    /// Get the cluster name if this error is associated with a specific member cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::MemberMissing { cluster, .. } => Some(cluster),
            Error::NoCompletedBackups { cluster, .. } => Some(cluster),
            Error::ClusterOperation { cluster, .. } => Some(cluster),
            Error::Kubeconfig { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
