//! Controller runner - builds one controller future per intent kind
//!
//! The futures share a single [`Context`] so the per-intent backoff and the
//! fleet resolver are the same across the three controllers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use kurator_backup::{
    backup_controller, error_policy, migrate_controller, restore_controller, Context,
};
use kurator_common::crd::{Backup, Migrate, Restore};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A running controller
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Build the Backup, Restore and Migrate controller futures
pub fn build_controllers(client: Client, concurrency: u16) -> Vec<ControllerFuture> {
    let ctx = Arc::new(Context::from_client(client.clone()));
    let config = ControllerConfig::default().concurrency(concurrency);
    let watcher = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);

    let backups: Api<Backup> = Api::all(client.clone());
    let backup_ctrl = Controller::new(backups, watcher())
        .with_config(config.clone())
        .shutdown_on_signal()
        .run(backup_controller::reconcile, error_policy, ctx.clone())
        .for_each(log_reconcile_result("Backup"));

    let restores: Api<Restore> = Api::all(client.clone());
    let restore_ctrl = Controller::new(restores, watcher())
        .with_config(config.clone())
        .shutdown_on_signal()
        .run(restore_controller::reconcile, error_policy, ctx.clone())
        .for_each(log_reconcile_result("Restore"));

    let migrates: Api<Migrate> = Api::all(client);
    let migrate_ctrl = Controller::new(migrates, watcher())
        .with_config(config)
        .shutdown_on_signal()
        .run(migrate_controller::reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Migrate"));

    tracing::info!(concurrency, "- Backup controller");
    tracing::info!(concurrency, "- Restore controller");
    tracing::info!(concurrency, "- Migrate controller");

    vec![Box::pin(backup_ctrl), Box::pin(restore_ctrl), Box::pin(migrate_ctrl)]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
