//! CRD installation utilities
//!
//! The operator owns the `backup.kurator.dev` CRDs and installs them with
//! server-side apply on startup, so the served schema always matches the
//! running version. Fleet and AttachedCluster are owned by the fleet manager
//! and only read here.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use kurator_common::crd::{Backup, Migrate, Restore};
use kurator_common::FIELD_MANAGER;

/// CRDs served by this operator, in install order
pub fn owned_crds() -> Vec<CustomResourceDefinition> {
    vec![Backup::crd(), Restore::crd(), Migrate::crd()]
}

/// Multi-document YAML of every owned CRD, as printed by `--crd`
pub fn crd_manifests() -> anyhow::Result<String> {
    let docs = owned_crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?;
    Ok(docs.join("---\n"))
}

/// Install or update every owned CRD
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in owned_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("All Kurator backup CRDs installed/updated");
    Ok(())
}
