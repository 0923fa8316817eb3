//! Shared controller state and host-cluster access
//!
//! The reconcilers only see the host cluster through [`KubeClient`] and
//! member clusters through [`FleetResolver`], so both sides can be mocked.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{error, warn};

#[cfg(test)]
use mockall::automock;

use kurator_common::crd::{
    Backup, BackupStatus, IntentKind, Migrate, MigrateStatus, Restore, RestoreStatus,
};
use kurator_common::kube_utils::{add_finalizer, patch_resource_status, remove_finalizer};
use kurator_common::metrics::ReconcileTimer;
use kurator_common::{Error, FIELD_MANAGER};

use crate::fleet::{FleetManager, FleetResolver, KubeFleetManager};

/// First retry delay after a failed reconcile
const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Upper bound on the retry delay
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Host-cluster operations the reconcilers need
///
/// Mocked in unit tests; [`KubeClientImpl`] talks to the API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Backup intent, `None` if it does not exist
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>, Error>;

    /// Replace the status of a Backup intent
    async fn patch_backup_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackupStatus,
    ) -> Result<(), Error>;

    /// Replace the status of a Restore intent
    async fn patch_restore_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RestoreStatus,
    ) -> Result<(), Error>;

    /// Replace the status of a Migrate intent
    async fn patch_migrate_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MigrateStatus,
    ) -> Result<(), Error>;

    /// Add the intent kind's finalizer if missing
    async fn add_finalizer(
        &self,
        kind: IntentKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error>;

    /// Remove the intent kind's finalizer; a deleted intent is not an error
    async fn remove_finalizer(
        &self,
        kind: IntentKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error>;
}

/// [`KubeClient`] backed by the host cluster's API server
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Wrap a host cluster client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>, Error> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_backup_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackupStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<Backup>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn patch_restore_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RestoreStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<Restore>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn patch_migrate_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MigrateStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<Migrate>(&self.client, name, namespace, status, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn add_finalizer(
        &self,
        kind: IntentKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        let finalizer = kind.finalizer();
        match kind {
            IntentKind::Backup => {
                add_finalizer::<Backup>(&self.client, name, namespace, finalizer, FIELD_MANAGER)
                    .await
            }
            IntentKind::Restore => {
                add_finalizer::<Restore>(&self.client, name, namespace, finalizer, FIELD_MANAGER)
                    .await
            }
            IntentKind::Migrate => {
                add_finalizer::<Migrate>(&self.client, name, namespace, finalizer, FIELD_MANAGER)
                    .await
            }
        }
    }

    async fn remove_finalizer(
        &self,
        kind: IntentKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        let finalizer = kind.finalizer();
        match kind {
            IntentKind::Backup => {
                remove_finalizer::<Backup>(&self.client, name, namespace, finalizer, FIELD_MANAGER)
                    .await
            }
            IntentKind::Restore => {
                remove_finalizer::<Restore>(&self.client, name, namespace, finalizer, FIELD_MANAGER)
                    .await
            }
            IntentKind::Migrate => {
                remove_finalizer::<Migrate>(&self.client, name, namespace, finalizer, FIELD_MANAGER)
                    .await
            }
        }
    }
}

/// Shared context for the Backup, Restore and Migrate controllers
pub struct Context {
    /// Host cluster access (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Destination resolution and member cluster clients
    pub fleet: FleetResolver,
    /// Consecutive failures per intent, reset by a successful reconcile
    backoff: DashMap<String, u32>,
}

impl Context {
    /// Create a context from explicit host and fleet access
    pub fn new(kube: Arc<dyn KubeClient>, fleet: Arc<dyn FleetManager>) -> Self {
        Self {
            kube,
            fleet: FleetResolver::new(fleet),
            backoff: DashMap::new(),
        }
    }

    /// Create the production context from a host cluster client
    pub fn from_client(client: Client) -> Self {
        Self::new(
            Arc::new(KubeClientImpl::new(client.clone())),
            Arc::new(KubeFleetManager::new(client)),
        )
    }

    /// Record a failure for `key` and return how long to wait before retrying
    fn next_backoff(&self, key: &str) -> Duration {
        let mut attempts = self.backoff.entry(key.to_string()).or_insert(0);
        *attempts = attempts.saturating_add(1);
        backoff_delay(*attempts)
    }

    fn reset_backoff(&self, key: &str) {
        self.backoff.remove(key);
    }
}

/// Delay before retry number `attempt` (1-based): 5s doubling up to 5 minutes
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    BACKOFF_BASE
        .checked_mul(1u32 << exponent)
        .map_or(BACKOFF_MAX, |d| d.min(BACKOFF_MAX))
}

/// Backoff key of an intent: `Kind/namespace/name`
pub(crate) fn intent_key<K>(obj: &K) -> String
where
    K: Resource<DynamicType = ()>,
{
    format!(
        "{}/{}/{}",
        K::kind(&()),
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Namespace and name of a namespaced intent
pub(crate) fn namespaced_name<K>(obj: &K) -> Result<(String, String), Error>
where
    K: Resource<DynamicType = ()>,
{
    let namespace = obj.namespace().ok_or_else(|| {
        Error::internal_with_context(
            "reconcile",
            format!("{} {} has no namespace", K::kind(&()), obj.name_any()),
        )
    })?;
    Ok((namespace, obj.name_any()))
}

/// Error policy shared by the intent controllers
///
/// Errors that need a spec change wait for one; everything else is retried
/// with a per-intent exponential backoff.
pub fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource<DynamicType = ()>,
{
    let key = intent_key(obj.as_ref());
    if !error.is_retryable() {
        error!(?error, intent = %key, reason = error.reason(), "reconciliation failed permanently");
        ctx.reset_backoff(&key);
        return Action::await_change();
    }

    let delay = ctx.next_backoff(&key);
    warn!(
        ?error,
        intent = %key,
        reason = error.reason(),
        retry_in_secs = delay.as_secs(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}

/// Run one reconcile with timing, panic isolation and backoff bookkeeping.
///
/// A panic inside `fut` becomes an [`Error::Internal`] so that one bad
/// intent cannot take down the controller.
pub(crate) async fn guarded<F>(
    controller: &'static str,
    key: &str,
    ctx: &Context,
    fut: F,
) -> Result<Action, Error>
where
    F: Future<Output = Result<Action, Error>>,
{
    let timer = ReconcileTimer::start(controller);
    let result = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(Error::internal_with_context(
            controller,
            format!(
                "reconcile of {} panicked: {}",
                key,
                panic_message(panic.as_ref())
            ),
        )),
    };

    match &result {
        Ok(_) => {
            ctx.reset_backoff(key);
            timer.success();
        }
        Err(e) => timer.error(e.reason()),
    }
    result
}

/// Add the intent kind's finalizer unless the object already carries it
pub(crate) async fn ensure_finalizer<K>(
    ctx: &Context,
    obj: &K,
    kind: IntentKind,
    namespace: &str,
    name: &str,
) -> Result<(), Error>
where
    K: Resource,
{
    if obj.finalizers().iter().any(|f| f == kind.finalizer()) {
        return Ok(());
    }
    ctx.kube.add_finalizer(kind, namespace, name).await
}

/// Combine a reconcile result with the outcome of its status patch.
///
/// The reconcile error wins; a failed patch after a successful reconcile
/// is returned so the intent is retried.
pub(crate) fn settle(
    result: Result<Action, Error>,
    patched: Result<(), Error>,
) -> Result<Action, Error> {
    match (result, patched) {
        (Ok(action), Ok(())) => Ok(action),
        (Ok(_), Err(patch_err)) => Err(patch_err),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(patch_err)) => {
            warn!(error = %patch_err, "status patch failed after reconcile error");
            Err(e)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
