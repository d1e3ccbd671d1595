use crate::updated_sidecar_image;
use async_trait::async_trait;
use mesh_injector_controller_core::{ClassifyFailure, FailureClass};
use mesh_injector_controller_k8s_api::{
    mesh_config::{MESH_CONFIG_MAP, SIDECAR_IMAGE_KEY},
    Api, Client, ConfigMap, MeshConfig, Patch, PatchParams, CONTROL_PLANE_POLL_INTERVAL,
};

/// The external mesh control plane, reduced to the one call this controller
/// makes against it.
#[async_trait]
pub trait ProxyVersionSource {
    type Error: ClassifyFailure + std::fmt::Display + Send;

    async fn latest_proxy_version(&self) -> Result<String, Self::Error>;
}

/// Stands in where no mesh control plane is configured; it cannot be
/// constructed, so the poller is simply not spawned.
pub enum NoControlPlane {}

#[async_trait]
impl ProxyVersionSource for NoControlPlane {
    type Error = kube::Error;

    async fn latest_proxy_version(&self) -> Result<String, Self::Error> {
        match *self {}
    }
}

/// Polls the control plane for the latest proxy version and keeps the mesh
/// ConfigMap's sidecar image current when auto-update is enabled. The
/// upgrade reconciler picks the write up through its ConfigMap watch.
pub async fn run_version_poller<S>(client: Client, controller_namespace: String, source: S)
where
    S: ProxyVersionSource + Send + Sync,
{
    let mut interval = tokio::time::interval(CONTROL_PLANE_POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(error) = poll_once(&client, &controller_namespace, &source).await {
            tracing::warn!(%error, "Proxy version poll failed");
        }
    }
}

async fn poll_once<S>(
    client: &Client,
    controller_namespace: &str,
    source: &S,
) -> anyhow::Result<()>
where
    S: ProxyVersionSource + Send + Sync,
{
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), controller_namespace);
    let cm = match config_maps.get(MESH_CONFIG_MAP).await {
        Ok(cm) => cm,
        Err(error) if error.is_not_found() => return Ok(()),
        Err(error) => return Err(error.into()),
    };
    let auto_update = MeshConfig::from_config_map(&cm)
        .map(|c| c.auto_update_proxy_version)
        .unwrap_or(false);
    if !auto_update {
        return Ok(());
    }

    let latest = match source.latest_proxy_version().await {
        Ok(version) => version,
        Err(error) => {
            match error.classify() {
                FailureClass::Transient => {
                    tracing::info!(%error, "Control plane unavailable, retrying next poll");
                }
                _ => {
                    tracing::warn!(%error, "Control plane rejected the version query");
                }
            }
            return Ok(());
        }
    };

    if let Some(image) = updated_sidecar_image(&cm, &latest) {
        let patch = serde_json::json!({ "data": { SIDECAR_IMAGE_KEY: image } });
        config_maps
            .patch(MESH_CONFIG_MAP, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        tracing::info!(version = %latest, "Updated sidecar image to the latest proxy version");
    }
    Ok(())
}
