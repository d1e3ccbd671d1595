#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod binding;
pub mod labels;
pub mod mesh_config;

pub use self::{
    binding::{VirtualDeploymentBinding, VirtualDeploymentBindingSpec},
    labels::Labels,
    mesh_config::MeshConfig,
};
pub use k8s_openapi::api::{
    self,
    core::v1::{
        ConfigMap, Container, ContainerPort, EnvVar, HTTPGetAction, Namespace, Pod, PodSpec,
        PodStatus, Probe, Service, ServiceSpec,
    },
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams},
    Client, Resource, ResourceExt,
};
use std::time::Duration;

/// Label that opts a namespace or pod into (or out of) sidecar injection.
pub const INJECTION_LABEL: &str = "meshcontrol.io/sidecar-injection";
pub const INJECTION_ENABLED: &str = "enabled";
pub const INJECTION_DISABLED: &str = "disabled";

/// Pod annotation selecting the proxy log level.
pub const PROXY_LOG_LEVEL_ANNOTATION: &str = "meshcontrol.io/proxy-log-level";
/// Pod annotation recording the binding that injected it, as `namespace/name`.
pub const BINDING_REF_ANNOTATION: &str = "meshcontrol.io/binding-ref";
/// Pod annotation recording the resolved virtual deployment identifier.
pub const VIRTUAL_DEPLOYMENT_ANNOTATION: &str = "meshcontrol.io/virtual-deployment";
/// Best-effort marker for pods whose proxy version cannot be upgraded in place.
pub const PROXY_OUTDATED_ANNOTATION: &str = "meshcontrol.io/proxy-outdated";

pub const SIDECAR_CONTAINER_NAME: &str = "mesh-proxy";
pub const INIT_CONTAINER_NAME: &str = "mesh-proxy-init";

/// Port the sidecar serves Prometheus metrics on.
pub const PROXY_METRICS_PORT: i32 = 9090;
/// Local endpoint the sidecar's own liveness probe targets.
pub const PROXY_HEALTH_PORT: i32 = 15901;
pub const PROXY_HEALTH_PATH: &str = "/healthz";
/// Endpoint the health-check proxy listens on; rewritten workload probes
/// point here.
pub const HEALTH_PROXY_PORT: i32 = 15902;
pub const HEALTH_PROXY_PATH: &str = "/probe";
/// Port inbound traffic is redirected to by the init container.
pub const PROXY_INBOUND_PORT: i32 = 15001;

/// Headers carrying the original probe target for the health-check proxy.
pub const ORIGINAL_PROBE_SCHEME_HEADER: &str = "x-original-probe-scheme";
pub const ORIGINAL_PROBE_HOST_HEADER: &str = "x-original-probe-host";
pub const ORIGINAL_PROBE_PORT_HEADER: &str = "x-original-probe-port";
pub const ORIGINAL_PROBE_PATH_HEADER: &str = "x-original-probe-path";

/// Delay before retrying a rollout whose evictions were rejected by a
/// disruption budget.
pub const EVICTION_RETRY: Duration = Duration::from_secs(60);
/// Periodic full re-evaluation of every reconciled key.
pub const FULL_SYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// How often the mesh control plane is polled for the latest proxy version.
pub const CONTROL_PLANE_POLL_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Extracts the version tag from an image reference, tolerating registries
/// with ports (`registry:5000/mesh/proxy:1.2.3` -> `1.2.3`).
pub fn image_version(image: &str) -> &str {
    let repo = image.rsplit('/').next().unwrap_or(image);
    match repo.split_once(':') {
        Some((_, tag)) => tag,
        None => "",
    }
}

/// The proxy version embedded in a pod: the image tag of its sidecar
/// container, or empty if the pod carries no sidecar.
pub fn pod_proxy_version(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|spec| {
            spec.containers
                .iter()
                .find(|c| c.name == SIDECAR_CONTAINER_NAME)
        })
        .and_then(|c| c.image.as_deref())
        .map(image_version)
        .unwrap_or("")
}

/// Whether a pod already carries the proxy sidecar.
pub fn pod_has_sidecar(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .any(|c| c.name == SIDECAR_CONTAINER_NAME)
        })
        .unwrap_or(false)
}
