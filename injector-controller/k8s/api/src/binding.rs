use crate::labels;
use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Binds a Kubernetes Service (and the pods behind it) to a mesh virtual
/// deployment, marking those pods for sidecar injection.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "meshcontrol.io",
    version = "v1alpha1",
    kind = "VirtualDeploymentBinding",
    status = "VirtualDeploymentBindingStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDeploymentBindingSpec {
    /// Identifier of the mesh virtual deployment the target pods belong to.
    pub virtual_deployment: String,
    pub target: Target,
    /// Overrides the sidecar's default resource requests and limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub service: ServiceRef,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub name: String,
    /// Defaults to the binding's own namespace when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub match_labels: labels::Map,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDeploymentBindingStatus {
    #[serde(default)]
    pub conditions: Vec<BindingCondition>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindingCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False`, or `Unknown`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// === impl VirtualDeploymentBinding ===

impl VirtualDeploymentBinding {
    /// A binding is active iff it has at least one condition and all of them
    /// are `True`.
    pub fn is_active(&self) -> bool {
        self.status
            .as_ref()
            .map(|status| {
                !status.conditions.is_empty()
                    && status.conditions.iter().all(|c| c.status == "True")
            })
            .unwrap_or(false)
    }

    /// The namespace the target service resolves into.
    pub fn target_namespace(&self) -> String {
        self.spec
            .target
            .service
            .namespace
            .clone()
            .unwrap_or_else(|| self.namespace().unwrap_or_default())
    }

    /// `namespace/name` reference, as recorded in the pod annotation.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }
}
