//! OpenTelemetry instruments for the backup controllers
//!
//! Instruments are created lazily against the global meter, so they are
//! no-ops until telemetry installs an exporting meter provider.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("kurator"));

/// Histogram of intent reconcile duration
///
/// Labels:
/// - `controller`: backup, restore, migrate
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("kurator_backup_reconcile_duration_seconds")
        .with_description("Duration of intent reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed reconciles
///
/// Labels:
/// - `controller`: backup, restore, migrate
/// - `reason`: error reason (FleetNotFound, KubernetesError, ...)
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kurator_backup_reconcile_errors_total")
        .with_description("Total number of intent reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of agent objects applied into member clusters
///
/// Labels:
/// - `kind`: Backup, Schedule, Restore, BackupStorageLocation
/// - `cluster`: member cluster name
pub static AGENT_OBJECTS_APPLIED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kurator_backup_agent_objects_applied_total")
        .with_description("Total number of agent objects applied to member clusters")
        .with_unit("{objects}")
        .build()
});

/// Counter of agent objects removed by deletion cascades
///
/// Labels:
/// - `kind`: Backup, Schedule, Restore, BackupStorageLocation
pub static AGENT_OBJECTS_DELETED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kurator_backup_agent_objects_deleted_total")
        .with_description("Total number of agent objects deleted from member clusters")
        .with_unit("{objects}")
        .build()
});

/// Times one reconcile and records its outcome
pub struct ReconcileTimer {
    controller: &'static str,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconcile of the given controller
    pub fn start(controller: &'static str) -> Self {
        Self {
            controller,
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record a failed reconcile with the error's reason
    pub fn error(self, reason: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("controller", self.controller),
                KeyValue::new("reason", reason),
            ],
        );
    }
}

/// Record one agent object applied into a member cluster
pub fn record_agent_applied(kind: &'static str, cluster: &str) {
    AGENT_OBJECTS_APPLIED.add(
        1,
        &[
            KeyValue::new("kind", kind),
            KeyValue::new("cluster", cluster.to_string()),
        ],
    );
}

/// Record one agent object deleted from a member cluster
pub fn record_agent_deleted(kind: &'static str) {
    AGENT_OBJECTS_DELETED.add(1, &[KeyValue::new("kind", kind)]);
}
