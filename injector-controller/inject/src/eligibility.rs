use mesh_injector_controller_k8s_api::{INJECTION_DISABLED, INJECTION_ENABLED};

/// Whether a pod is eligible for sidecar injection, given the injection
/// labels on its namespace and on the pod itself (`None` = label absent).
///
/// The asymmetry is deliberate: in an injection-enabled namespace pods must
/// opt *out* explicitly, while in an injection-disabled namespace pods must
/// opt *in* explicitly. Any other label value on either side disables
/// injection.
pub fn eligible(namespace_label: Option<&str>, pod_label: Option<&str>) -> bool {
    let pod_label = pod_label.unwrap_or("");
    match namespace_label {
        Some(INJECTION_ENABLED) => pod_label == INJECTION_ENABLED || pod_label.is_empty(),
        Some(INJECTION_DISABLED) => pod_label == INJECTION_ENABLED,
        _ => false,
    }
}
