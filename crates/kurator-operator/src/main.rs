//! Kurator backup operator - Backup, Restore and Migrate across fleets

use clap::Parser;
use futures::future::join_all;

use kurator_common::kube_utils::create_client;
use kurator_common::leader_election::LeaderElector;
use kurator_common::telemetry::{init_telemetry, TelemetryConfig};
use kurator_operator::config::Cli;
use kurator_operator::controller_runner::build_controllers;
use kurator_operator::crds::{crd_manifests, ensure_crds_installed};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    let _telemetry = init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {}", e))?;

    run(cli).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = create_client(cli.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let mut leadership = if cli.leader_election {
        let identity = cli.lease_identity();
        let elector = LeaderElector::new(client.clone(), &cli.lease_namespace, &identity);
        Some(elector.acquire().await)
    } else {
        tracing::warn!("Leader election disabled, this replica must be the only one running");
        None
    };

    tracing::info!("Starting Kurator backup controllers...");
    let controllers = join_all(build_controllers(client, cli.concurrency()));

    match leadership.as_mut() {
        Some(guard) => {
            tokio::select! {
                _ = controllers => tracing::info!("Controllers stopped"),
                _ = guard.lost() => {
                    // Another replica may already be reconciling; stop writing at once.
                    tracing::error!("Leadership lost, exiting");
                    std::process::exit(1);
                }
            }
        }
        None => {
            controllers.await;
            tracing::info!("Controllers stopped");
        }
    }

    if let Some(guard) = leadership {
        if let Err(e) = guard.release_leadership().await {
            tracing::warn!(error = %e, "Failed to release leader lease");
        }
    }

    tracing::info!("Kurator backup operator shutting down");
    Ok(())
}
