use crate::image_version;
use k8s_openapi::api::core::v1::ConfigMap;

/// Name of the mesh ConfigMap in the controller's namespace.
pub const MESH_CONFIG_MAP: &str = "mesh-config";

pub const SIDECAR_IMAGE_KEY: &str = "SIDECAR_IMAGE";
pub const DATAPLANE_ENDPOINT_KEY: &str = "DATAPLANE_ENDPOINT";
pub const CONTROLPLANE_ENDPOINT_KEY: &str = "CONTROLPLANE_ENDPOINT";
pub const AUTO_UPDATE_PROXY_VERSION_KEY: &str = "AUTO_UPDATE_PROXY_VERSION";

/// Read-view over the mesh ConfigMap. Source of truth for the latest proxy
/// version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshConfig {
    pub sidecar_image: String,
    pub dataplane_endpoint: Option<String>,
    pub controlplane_endpoint: Option<String>,
    pub auto_update_proxy_version: bool,
}

impl MeshConfig {
    /// Returns `None` when the sidecar image key is missing, which callers
    /// treat as a hard configuration error on the injection path.
    pub fn from_config_map(cm: &ConfigMap) -> Option<Self> {
        let data = cm.data.as_ref()?;
        let sidecar_image = data.get(SIDECAR_IMAGE_KEY)?.clone();
        Some(Self {
            sidecar_image,
            dataplane_endpoint: data.get(DATAPLANE_ENDPOINT_KEY).cloned(),
            controlplane_endpoint: data.get(CONTROLPLANE_ENDPOINT_KEY).cloned(),
            auto_update_proxy_version: data
                .get(AUTO_UPDATE_PROXY_VERSION_KEY)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    /// The version tag of the configured sidecar image.
    pub fn proxy_version(&self) -> &str {
        image_version(&self.sidecar_image)
    }
}
