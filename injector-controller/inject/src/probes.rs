use k8s_openapi::{
    api::core::v1::{HTTPHeader, Probe},
    apimachinery::pkg::util::intstr::IntOrString,
};
use mesh_injector_controller_k8s_api::{
    HEALTH_PROXY_PATH, HEALTH_PROXY_PORT, ORIGINAL_PROBE_HOST_HEADER, ORIGINAL_PROBE_PATH_HEADER,
    ORIGINAL_PROBE_PORT_HEADER, ORIGINAL_PROBE_SCHEME_HEADER, PodSpec, SIDECAR_CONTAINER_NAME,
};

/// Redirects every HTTP probe of the workload containers at the co-located
/// health-check proxy, appending headers that carry the original scheme,
/// host, port, and path so the proxy can reconstruct and forward the probe.
///
/// TCP and exec probes are left untouched. The rewrite appends its capture
/// headers unconditionally, so it must not be re-run on an already-rewritten
/// spec.
pub fn rewrite_probes(spec: &mut PodSpec) {
    for container in spec
        .containers
        .iter_mut()
        .filter(|c| c.name != SIDECAR_CONTAINER_NAME)
    {
        let declared_ports: Vec<(String, i32)> = container
            .ports
            .iter()
            .flatten()
            .filter_map(|p| p.name.clone().map(|name| (name, p.container_port)))
            .collect();

        for probe in [
            container.startup_probe.as_mut(),
            container.readiness_probe.as_mut(),
            container.liveness_probe.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            rewrite_http_probe(probe, &declared_ports);
        }
    }
}

fn rewrite_http_probe(probe: &mut Probe, declared_ports: &[(String, i32)]) {
    let Some(http) = probe.http_get.as_mut() else {
        return;
    };

    let scheme = http
        .scheme
        .as_deref()
        .unwrap_or("HTTP")
        .to_ascii_lowercase();
    let host = http.host.clone().unwrap_or_else(|| "localhost".to_string());
    let port = resolve_port(&http.port, declared_ports);
    let path = http.path.clone().unwrap_or_else(|| "/".to_string());

    let headers = http.http_headers.get_or_insert_with(Vec::new);
    for (name, value) in [
        (ORIGINAL_PROBE_SCHEME_HEADER, scheme),
        (ORIGINAL_PROBE_HOST_HEADER, host),
        (ORIGINAL_PROBE_PORT_HEADER, port),
        (ORIGINAL_PROBE_PATH_HEADER, path),
    ] {
        headers.push(HTTPHeader {
            name: name.to_string(),
            value,
        });
    }

    http.scheme = Some("HTTP".to_string());
    http.port = IntOrString::Int(HEALTH_PROXY_PORT);
    http.path = Some(HEALTH_PROXY_PATH.to_string());
}

/// Resolves a named port against the container's declared ports; a name that
/// resolves nowhere keeps its literal form.
fn resolve_port(port: &IntOrString, declared_ports: &[(String, i32)]) -> String {
    match port {
        IntOrString::Int(p) => p.to_string(),
        IntOrString::String(name) => declared_ports
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.to_string())
            .unwrap_or_else(|| name.clone()),
    }
}
