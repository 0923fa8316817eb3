//! Single-writer guarantee across operator replicas
//!
//! Replicas compete for a coordination.k8s.io/v1 Lease. Every write to the
//! lease carries the resourceVersion that was read, so two replicas racing
//! for an expired lease cannot both win: the loser gets 409 Conflict.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::kube_utils::is_not_found;
use crate::FIELD_MANAGER;

/// Lease shared by all replicas of the backup operator
pub const LEADER_LEASE_NAME: &str = "kurator-backup-operator-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease came back without a resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// What to do with the lease as observed
#[derive(Debug, Clone, PartialEq, Eq)]
enum LeaseStep {
    /// No lease exists yet
    Create,
    /// We hold it; bump renewTime
    Renew,
    /// Holder let it expire; take it over with the given transition count
    TakeOver { transitions: i32 },
    /// Somebody else holds a live lease
    Wait,
}

fn next_step(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseStep {
    let Some(lease) = lease else {
        return LeaseStep::Create;
    };
    let spec = lease.spec.as_ref();
    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseStep::Renew;
    }
    let expired = match (
        spec.and_then(|s| s.renew_time.as_ref()),
        spec.and_then(|s| s.lease_duration_seconds),
    ) {
        (Some(renewed), Some(secs)) => now > renewed.0 + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    };
    if expired {
        LeaseStep::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    } else {
        LeaseStep::Wait
    }
}

/// Competes for the operator lease
pub struct LeaderElector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
}

impl LeaderElector {
    /// Create an elector for `identity` (normally the pod name)
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: LEADER_LEASE_NAME.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Block until this replica holds the lease.
    ///
    /// The returned guard renews the lease in the background until it is
    /// dropped or a renewal fails.
    pub async fn acquire(self) -> LeaderGuard {
        info!(identity = %self.identity, lease = %self.lease_name, "Waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => break,
                Ok(false) => debug!(identity = %self.identity, "Lease held by another replica"),
                Err(e) => warn!(
                    identity = %self.identity,
                    error = %e,
                    "Lease acquisition failed, retrying"
                ),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
        info!(identity = %self.identity, "Leadership acquired");

        let (lost_tx, lost_rx) = oneshot::channel();
        let api = self.api.clone();
        let lease_name = self.lease_name.clone();
        let identity = self.identity.clone();
        let renewal = tokio::spawn(async move {
            self.renew_until_lost(lost_tx).await;
        });
        LeaderGuard {
            api,
            lease_name,
            identity,
            renewal,
            lost_rx: Some(lost_rx),
        }
    }

    async fn renew_until_lost(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(identity = %self.identity, "Leadership lost to another replica");
                    break;
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        "Lease renewal failed, leadership lost"
                    );
                    break;
                }
            }
        }
        let _ = lost_tx.send(());
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let now = Utc::now();
        let existing = match self.api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(e) if is_not_found(&e) => None,
            Err(e) => return Err(e.into()),
        };

        let lease = match (next_step(existing.as_ref(), &self.identity, now), existing) {
            (LeaseStep::Wait, _) => return Ok(false),
            (LeaseStep::Create, _) => {
                let lease = self.held_lease(None, now, 0);
                return self.write(self.api.create(&PostParams::default(), &lease).await);
            }
            (LeaseStep::Renew, Some(mut lease)) => {
                self.resource_version(&lease)?;
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                lease
            }
            (LeaseStep::TakeOver { transitions }, Some(lease)) => {
                let rv = self.resource_version(&lease)?;
                self.held_lease(Some(rv), now, transitions + 1)
            }
            (_, None) => return Ok(false),
        };
        self.write(
            self.api
                .replace(&self.lease_name, &PostParams::default(), &lease)
                .await,
        )
    }

    /// 409 means another replica wrote the lease after we read it
    fn write(&self, result: Result<Lease, kube::Error>) -> Result<bool, LeaderElectionError> {
        match result {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn resource_version(&self, lease: &Lease) -> Result<String, LeaderElectionError> {
        lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::MissingResourceVersion(self.lease_name.clone()))
    }

    fn held_lease(
        &self,
        resource_version: Option<String>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }
}

/// Held while this replica is the leader
pub struct LeaderGuard {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    renewal: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Resolves once a renewal fails or another replica takes the lease
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Hand the lease back so a standby can take over without waiting for expiry
    pub async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        self.renewal.abort();
        let lease = match self.api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref()) != Some(&self.identity) {
            return Ok(());
        }

        let expired = Utc::now() - chrono::Duration::seconds(LEASE_DURATION.as_secs() as i64 * 2);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": MicroTime(expired),
            }
        });
        self.api
            .patch(
                &self.lease_name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal.abort();
    }
}
