use crate::probes::rewrite_probes;
use anyhow::{bail, Result};
use k8s_openapi::{
    api::core::v1::{
        Capabilities, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction,
        ObjectFieldSelector, Probe, ResourceRequirements, SecurityContext,
    },
    apimachinery::pkg::{api::resource::Quantity, util::intstr::IntOrString},
};
use mesh_injector_controller_k8s_api::{
    BINDING_REF_ANNOTATION, INIT_CONTAINER_NAME, MeshConfig, Pod, PROXY_HEALTH_PATH,
    PROXY_HEALTH_PORT, PROXY_INBOUND_PORT, PROXY_LOG_LEVEL_ANNOTATION, PROXY_METRICS_PORT,
    SIDECAR_CONTAINER_NAME, VIRTUAL_DEPLOYMENT_ANNOTATION, VirtualDeploymentBinding,
};
use std::{fmt, str::FromStr};

/// A single stage of the mutation pipeline.
pub trait Mutate {
    fn mutate(&self, pod: &mut Pod) -> Result<()>;
}

/// Log level for the injected proxy, selected by a pod annotation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ProxyLogLevel {
    Debug,
    Info,
    Warn,
    #[default]
    Error,
    Off,
}

impl FromStr for ProxyLogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "off" => Ok(Self::Off),
            other => bail!("invalid proxy log level {other:?}"),
        }
    }
}

impl fmt::Display for ProxyLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Off => "off",
        };
        s.fmt(f)
    }
}

/// Reads the pod's log-level annotation, defaulting to `error`. An invalid
/// value is an error that aborts the whole admission request.
pub fn proxy_log_level(pod: &Pod) -> Result<ProxyLogLevel> {
    match pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(PROXY_LOG_LEVEL_ANNOTATION))
    {
        Some(level) => level.parse(),
        None => Ok(ProxyLogLevel::default()),
    }
}

/// Injects the privileged init container that redirects the pod's inbound
/// traffic to the sidecar.
pub struct InitContainer<'a> {
    pub config: &'a MeshConfig,
}

impl Mutate for InitContainer<'_> {
    fn mutate(&self, pod: &mut Pod) -> Result<()> {
        let container = Container {
            name: INIT_CONTAINER_NAME.to_string(),
            image: Some(self.config.sidecar_image.clone()),
            env: Some(vec![
                env_value("ENABLE_INBOUND_REDIRECT", "true"),
                env_value("PROXY_INBOUND_PORT", &PROXY_INBOUND_PORT.to_string()),
            ]),
            security_context: Some(SecurityContext {
                capabilities: Some(Capabilities {
                    add: Some(vec!["NET_ADMIN".to_string()]),
                    drop: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        pod.spec
            .get_or_insert_with(Default::default)
            .init_containers
            .get_or_insert_with(Vec::new)
            .push(container);
        Ok(())
    }
}

/// Injects the proxy sidecar container itself.
pub struct SidecarContainer<'a> {
    pub config: &'a MeshConfig,
    pub binding: &'a VirtualDeploymentBinding,
}

impl Mutate for SidecarContainer<'_> {
    fn mutate(&self, pod: &mut Pod) -> Result<()> {
        let log_level = proxy_log_level(pod)?;

        let mut env = vec![
            env_value("DEPLOYMENT_ID", &self.binding.spec.virtual_deployment),
            env_value("PROXY_LOG_LEVEL", &log_level.to_string()),
            // The proxy historically read POD_IP; both names point at the
            // same field until the legacy one is retired.
            env_field("POD_IP", "status.podIP"),
            env_field("PROXY_POD_IP", "status.podIP"),
        ];
        if let Some(endpoint) = &self.config.dataplane_endpoint {
            env.push(env_value("DATAPLANE_ENDPOINT", endpoint));
        }

        let resources = self
            .binding
            .spec
            .resources
            .clone()
            .unwrap_or_else(default_resources);

        let container = Container {
            name: SIDECAR_CONTAINER_NAME.to_string(),
            image: Some(self.config.sidecar_image.clone()),
            env: Some(env),
            ports: Some(vec![ContainerPort {
                name: Some("proxy-metrics".to_string()),
                container_port: PROXY_METRICS_PORT,
                ..Default::default()
            }]),
            resources: Some(resources),
            liveness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some(PROXY_HEALTH_PATH.to_string()),
                    port: IntOrString::Int(PROXY_HEALTH_PORT),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(5),
                period_seconds: Some(10),
                ..Default::default()
            }),
            ..Default::default()
        };

        pod.spec
            .get_or_insert_with(Default::default)
            .containers
            .push(container);
        Ok(())
    }
}

/// Runs the full mutation: probe rewrite, the ordered mutators, and the two
/// audit annotations.
pub fn inject_pod(
    pod: &mut Pod,
    config: &MeshConfig,
    binding: &VirtualDeploymentBinding,
) -> Result<()> {
    if let Some(spec) = pod.spec.as_mut() {
        rewrite_probes(spec);
    }

    let init = InitContainer { config };
    let sidecar = SidecarContainer { config, binding };
    let mutators: [&dyn Mutate; 2] = [&init, &sidecar];
    for mutator in mutators {
        mutator.mutate(pod)?;
    }

    let annotations = pod.metadata.annotations.get_or_insert_with(Default::default);
    annotations.insert(BINDING_REF_ANNOTATION.to_string(), binding.reference());
    annotations.insert(
        VIRTUAL_DEPLOYMENT_ANNOTATION.to_string(),
        binding.spec.virtual_deployment.clone(),
    );
    Ok(())
}

fn env_value(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn env_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
    }
}

fn default_resources() -> ResourceRequirements {
    let quantities = |cpu: &str, memory: &str| {
        [
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ]
        .into_iter()
        .collect()
    };
    ResourceRequirements {
        requests: Some(quantities("100m", "128Mi")),
        limits: Some(quantities("500m", "512Mi")),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use mesh_injector_controller_k8s_api::binding::{
        ServiceRef, Target, VirtualDeploymentBindingSpec,
    };

    fn mesh_config() -> MeshConfig {
        MeshConfig {
            sidecar_image: "mesh/proxy:1.4.0".to_string(),
            dataplane_endpoint: Some("dataplane.mesh:443".to_string()),
            controlplane_endpoint: None,
            auto_update_proxy_version: false,
        }
    }

    fn binding() -> VirtualDeploymentBinding {
        let mut b = VirtualDeploymentBinding::new(
            "web-binding",
            VirtualDeploymentBindingSpec {
                virtual_deployment: "vd-web".to_string(),
                target: Target {
                    service: ServiceRef {
                        name: "web".to_string(),
                        namespace: None,
                        match_labels: Default::default(),
                    },
                },
                resources: None,
            },
        );
        b.metadata.namespace = Some("apps".to_string());
        b
    }

    fn env_of<'a>(container: &'a Container, name: &str) -> Option<&'a EnvVar> {
        container.env.as_ref()?.iter().find(|e| e.name == name)
    }

    #[test]
    fn injects_init_and_sidecar_with_audit_annotations() {
        let mut pod = Pod::default();
        pod.spec = Some(Default::default());

        inject_pod(&mut pod, &mesh_config(), &binding()).expect("injection succeeds");

        let spec = pod.spec.as_ref().unwrap();
        let init = &spec.init_containers.as_ref().unwrap()[0];
        assert_eq!(init.name, INIT_CONTAINER_NAME);
        assert_eq!(
            init.security_context
                .as_ref()
                .and_then(|sc| sc.capabilities.as_ref())
                .and_then(|c| c.add.as_ref())
                .map(Vec::as_slice),
            Some(&["NET_ADMIN".to_string()][..])
        );
        assert_eq!(
            env_of(init, "PROXY_INBOUND_PORT").and_then(|e| e.value.as_deref()),
            Some("15001")
        );

        let sidecar = spec
            .containers
            .iter()
            .find(|c| c.name == SIDECAR_CONTAINER_NAME)
            .expect("sidecar injected");
        assert_eq!(sidecar.image.as_deref(), Some("mesh/proxy:1.4.0"));
        assert_eq!(
            env_of(sidecar, "DEPLOYMENT_ID").and_then(|e| e.value.as_deref()),
            Some("vd-web")
        );
        assert_eq!(
            env_of(sidecar, "PROXY_LOG_LEVEL").and_then(|e| e.value.as_deref()),
            Some("error"),
            "defaults to error"
        );
        assert_eq!(
            env_of(sidecar, "DATAPLANE_ENDPOINT").and_then(|e| e.value.as_deref()),
            Some("dataplane.mesh:443")
        );
        for name in ["POD_IP", "PROXY_POD_IP"] {
            let field = env_of(sidecar, name)
                .and_then(|e| e.value_from.as_ref())
                .and_then(|v| v.field_ref.as_ref())
                .map(|f| f.field_path.as_str());
            assert_eq!(field, Some("status.podIP"), "{name}");
        }

        let annotations = pod.metadata.annotations.as_ref().unwrap();
        assert_eq!(
            annotations.get(BINDING_REF_ANNOTATION).map(String::as_str),
            Some("apps/web-binding")
        );
        assert_eq!(
            annotations
                .get(VIRTUAL_DEPLOYMENT_ANNOTATION)
                .map(String::as_str),
            Some("vd-web")
        );
    }

    #[test]
    fn dataplane_endpoint_is_omitted_when_unconfigured() {
        let mut config = mesh_config();
        config.dataplane_endpoint = None;

        let mut pod = Pod::default();
        inject_pod(&mut pod, &config, &binding()).expect("injection succeeds");

        let sidecar = &pod.spec.as_ref().unwrap().containers[0];
        assert!(env_of(sidecar, "DATAPLANE_ENDPOINT").is_none());
    }

    #[test]
    fn binding_resources_override_the_defaults() {
        let mut b = binding();
        b.spec.resources = Some(ResourceRequirements {
            limits: Some(
                [("cpu".to_string(), Quantity("2".to_string()))]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        });

        let mut pod = Pod::default();
        inject_pod(&mut pod, &mesh_config(), &b).expect("injection succeeds");

        let sidecar = &pod.spec.as_ref().unwrap().containers[0];
        let limits = sidecar
            .resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .unwrap();
        assert_eq!(limits.get("cpu"), Some(&Quantity("2".to_string())));
        assert!(sidecar
            .resources
            .as_ref()
            .unwrap()
            .requests
            .is_none());
    }

    #[test]
    fn valid_log_level_annotation_is_applied() {
        let mut pod = Pod::default();
        pod.metadata.annotations = Some(btreemap! {
            PROXY_LOG_LEVEL_ANNOTATION.to_string() => "debug".to_string(),
        });

        inject_pod(&mut pod, &mesh_config(), &binding()).expect("injection succeeds");

        let sidecar = &pod.spec.as_ref().unwrap().containers[0];
        assert_eq!(
            env_of(sidecar, "PROXY_LOG_LEVEL").and_then(|e| e.value.as_deref()),
            Some("debug")
        );
    }

    #[test]
    fn invalid_log_level_aborts_the_mutation() {
        let mut pod = Pod::default();
        pod.metadata.annotations = Some(btreemap! {
            PROXY_LOG_LEVEL_ANNOTATION.to_string() => "verbose".to_string(),
        });

        let err = inject_pod(&mut pod, &mesh_config(), &binding())
            .expect_err("invalid log level must fail");
        assert!(err.to_string().contains("invalid proxy log level"));
    }

    #[test]
    fn sidecar_liveness_targets_the_local_health_endpoint() {
        let mut pod = Pod::default();
        inject_pod(&mut pod, &mesh_config(), &binding()).expect("injection succeeds");

        let sidecar = &pod.spec.as_ref().unwrap().containers[0];
        let http = sidecar
            .liveness_probe
            .as_ref()
            .and_then(|p| p.http_get.as_ref())
            .unwrap();
        assert_eq!(http.path.as_deref(), Some(PROXY_HEALTH_PATH));
        assert_eq!(http.port, IntOrString::Int(PROXY_HEALTH_PORT));
    }
}
