//! Kubernetes utility functions shared by the controllers
//!
//! Covers typed metadata for agent objects, `ApiResource` construction,
//! status and finalizer patches on the host cluster, and building clients
//! for member clusters from their kubeconfig.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::debug;

use crate::Error;

// =============================================================================
// ObjectMeta - metadata for agent objects
// =============================================================================

/// Kubernetes metadata for typed agent objects.
///
/// Only the fields the orchestrator writes or reads are modelled; anything
/// else the API server returns is ignored on deserialization. No labels are
/// added implicitly, callers set exactly the labels they need.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    #[serde(default)]
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create new metadata without labels
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Agent types whose API group, version, kind and plural are fixed.
///
/// Agent objects go through `DynamicObject`, so the `ApiResource` is derived
/// from these constants instead of discovery.
pub trait HasApiResource {
    /// `group/version`, e.g. `velero.io/v1`
    const API_VERSION: &'static str;
    /// Kind, e.g. `Backup`
    const KIND: &'static str;
    /// Plural resource name, e.g. `backups`
    const PLURAL: &'static str;

    /// The `ApiResource` addressing this type
    fn api_resource() -> ApiResource {
        let (group, version) = parse_api_version(Self::API_VERSION);
        ApiResource {
            group,
            version,
            kind: Self::KIND.to_string(),
            api_version: Self::API_VERSION.to_string(),
            plural: Self::PLURAL.to_string(),
        }
    }
}

/// Split an API version into group and version; core `v1` has no group
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Render labels as a `k=v,k=v` selector string
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether a kube error is a 404 from the API server
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(ae) if ae.code == 404)
}

// =============================================================================
// Host-cluster patches
// =============================================================================

/// Patch the status sub-resource of a namespaced Kubernetes resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch.
///
/// Returns `kube::Error` so callers can map to their own error type.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Add a finalizer to a namespaced resource if it is not already present
pub async fn add_finalizer<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    finalizer: &str,
    field_manager: &str,
) -> Result<(), Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let object = api.get(name).await?;
    let mut finalizers = object.meta().finalizers.clone().unwrap_or_default();

    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;

    debug!(%name, %namespace, %finalizer, "finalizer added");
    Ok(())
}

/// Remove a finalizer from a namespaced resource, tolerating an already-gone object
pub async fn remove_finalizer<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    finalizer: &str,
    field_manager: &str,
) -> Result<(), Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let object = match api.get(name).await {
        Ok(object) => object,
        Err(e) if is_not_found(&e) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let finalizers: Vec<String> = object
        .meta()
        .finalizers
        .as_ref()
        .map(|f| f.iter().filter(|s| *s != finalizer).cloned().collect())
        .unwrap_or_default();

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    match api
        .patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {}
        Err(e) if is_not_found(&e) => {}
        Err(e) => return Err(e.into()),
    }

    debug!(%name, %namespace, %finalizer, "finalizer removed");
    Ok(())
}

// =============================================================================
// Clients
// =============================================================================

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client for the host cluster from an optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Create a kube client for a member cluster from raw kubeconfig bytes
pub async fn client_from_kubeconfig(cluster: &str, raw: &[u8]) -> Result<Client, Error> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| Error::kubeconfig(cluster, format!("kubeconfig is not UTF-8: {}", e)))?;
    let kubeconfig: Kubeconfig = serde_yaml::from_str(text)
        .map_err(|e| Error::kubeconfig(cluster, format!("failed to parse kubeconfig: {}", e)))?;

    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::kubeconfig(cluster, format!("failed to load kubeconfig: {}", e)))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config)
        .map_err(|e| Error::kubeconfig(cluster, format!("failed to create client: {}", e)))
}
