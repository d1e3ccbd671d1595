use anyhow::Result;
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use mesh_injector_controller_inject::{eligible, inject_pod, match_binding};
use mesh_injector_controller_k8s_api::{
    self as k8s, Api, Client, ConfigMap, ListParams, MeshConfig, Namespace, Pod, ResourceExt,
    Service, VirtualDeploymentBinding, INJECTION_LABEL,
};
use mesh_injector_controller_k8s_index::{SharedClusterStore, SharedStore};
use prometheus_client::{
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Lists bindings straight from the API server. The admission path never
/// reads bindings from the watch cache: a stale binding list would inject
/// the wrong sidecar (or none at all) into a pod that is about to persist.
#[async_trait::async_trait]
pub trait ListBindings {
    async fn list_bindings(&self) -> Result<Vec<VirtualDeploymentBinding>, kube::Error>;
}

#[derive(Clone)]
pub struct ApiBindings(pub Client);

#[async_trait::async_trait]
impl ListBindings for ApiBindings {
    async fn list_bindings(&self) -> Result<Vec<VirtualDeploymentBinding>, kube::Error> {
        let api = Api::<VirtualDeploymentBinding>::all(self.0.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

#[derive(Clone)]
pub struct Admission<B> {
    namespaces: SharedClusterStore<Namespace>,
    services: SharedStore<Service>,
    config_maps: SharedStore<ConfigMap>,
    bindings: B,
    controller_namespace: Arc<str>,
    metrics: Metrics,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Review = kube::core::admission::AdmissionReview<Pod>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<Pod>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<kube::core::DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

#[derive(Clone, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet, Debug)]
struct OutcomeLabels {
    outcome: &'static str,
}

#[derive(Clone, Debug)]
pub struct Metrics {
    reviews: Family<OutcomeLabels, Counter>,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reviews = Family::<OutcomeLabels, Counter>::default();
        reg.register(
            "reviews",
            "Total number of pod admission reviews, by outcome",
            reviews.clone(),
        );
        Self { reviews }
    }

    fn observe(&self, outcome: &'static str) {
        self.reviews.get_or_create(&OutcomeLabels { outcome }).inc();
    }
}

// === impl Admission ===

impl<B> tower::Service<Request<hyper::body::Incoming>> for Admission<B>
where
    B: ListBindings + Clone + Send + Sync + 'static,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            use bytes::Buf;
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: Review = match serde_json::from_reader(bytes.reader()) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req).await
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl<B: ListBindings> Admission<B> {
    pub fn new(
        namespaces: SharedClusterStore<Namespace>,
        services: SharedStore<Service>,
        config_maps: SharedStore<ConfigMap>,
        bindings: B,
        controller_namespace: impl Into<Arc<str>>,
        metrics: Metrics,
    ) -> Self {
        Self {
            namespaces,
            services,
            config_maps,
            bindings,
            controller_namespace: controller_namespace.into(),
            metrics,
        }
    }

    async fn admit(self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);

        let Some(pod) = req.object else {
            return self.allow(rsp);
        };

        // During creation the pod's own namespace may be unset; the request
        // always carries it. Default it before serializing the original so
        // the patch never touches metadata.namespace.
        let mut pod = pod;
        let namespace = match pod
            .metadata
            .namespace
            .clone()
            .or_else(|| req.namespace.clone())
        {
            Some(ns) => ns,
            None => return self.allow(rsp),
        };
        pod.metadata.namespace = Some(namespace.clone());

        let original = match serde_json::to_value(&pod) {
            Ok(v) => v,
            Err(error) => return self.deny(rsp, &pod, error.into()),
        };

        let ns_label = match self.namespaces.read().get(&namespace) {
            Some(ns) => match ns.labels().get(INJECTION_LABEL) {
                Some(value) => value.clone(),
                None => return self.allow(rsp),
            },
            None => return self.allow(rsp),
        };

        let pod_label = pod.labels().get(INJECTION_LABEL).cloned();
        if !eligible(Some(&ns_label), pod_label.as_deref()) {
            return self.allow(rsp);
        }

        let bindings = match self.bindings.list_bindings().await {
            Ok(bindings) => bindings,
            Err(error) => return self.deny(rsp, &pod, error.into()),
        };

        let binding = match match_binding(&pod, &bindings, &self.services) {
            Some(binding) => binding.clone(),
            None => return self.allow(rsp),
        };
        if !binding.is_active() {
            return self.allow(rsp);
        }

        let config = match self.mesh_config() {
            Some(config) => config,
            None => {
                return self.deny(
                    rsp,
                    &pod,
                    anyhow::anyhow!("mesh configuration has no sidecar image"),
                )
            }
        };

        if let Err(error) = inject_pod(&mut pod, &config, &binding) {
            return self.deny(rsp, &pod, error);
        }

        let mutated = match serde_json::to_value(&pod) {
            Ok(v) => v,
            Err(error) => return self.deny(rsp, &pod, error.into()),
        };
        match rsp.with_patch(json_patch::diff(&original, &mutated)) {
            Ok(rsp) => {
                info!(
                    namespace = %namespace,
                    pod = %pod.name_any(),
                    binding = %binding.reference(),
                    "Injected sidecar",
                );
                self.metrics.observe("patched");
                rsp
            }
            Err(error) => {
                warn!(%error, "Failed to encode patch");
                self.metrics.observe("denied");
                AdmissionResponse::invalid(error)
            }
        }
    }

    fn mesh_config(&self) -> Option<MeshConfig> {
        self.config_maps
            .read()
            .get(&self.controller_namespace, k8s::mesh_config::MESH_CONFIG_MAP)
            .and_then(|cm| MeshConfig::from_config_map(&cm))
    }

    fn allow(&self, rsp: AdmissionResponse) -> AdmissionResponse {
        self.metrics.observe("skipped");
        rsp
    }

    fn deny(&self, rsp: AdmissionResponse, pod: &Pod, error: anyhow::Error) -> AdmissionResponse {
        info!(
            namespace = %pod.namespace().unwrap_or_default(),
            pod = %pod.name_any(),
            %error,
            "Denied",
        );
        self.metrics.observe("denied");
        rsp.deny(error)
    }
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubert::index::{IndexClusterResource, IndexNamespacedResource};
    use maplit::btreemap;
    use mesh_injector_controller_k8s_api::{
        binding::{
            BindingCondition, ServiceRef, Target, VirtualDeploymentBindingSpec,
            VirtualDeploymentBindingStatus,
        },
        mesh_config::SIDECAR_IMAGE_KEY,
        ServiceSpec, BINDING_REF_ANNOTATION, INIT_CONTAINER_NAME, SIDECAR_CONTAINER_NAME,
        VIRTUAL_DEPLOYMENT_ANNOTATION,
    };
    use mesh_injector_controller_k8s_index::{ClusterStore, Store};
    use serde_json::json;

    #[derive(Clone)]
    struct StaticBindings(Vec<VirtualDeploymentBinding>);

    #[async_trait::async_trait]
    impl ListBindings for StaticBindings {
        async fn list_bindings(&self) -> Result<Vec<VirtualDeploymentBinding>, kube::Error> {
            Ok(self.0.clone())
        }
    }

    fn binding(active: bool) -> VirtualDeploymentBinding {
        let mut binding = VirtualDeploymentBinding::new(
            "cart-binding",
            VirtualDeploymentBindingSpec {
                virtual_deployment: "vd-cart".to_string(),
                target: Target {
                    service: ServiceRef {
                        name: "cart".to_string(),
                        namespace: None,
                        match_labels: btreemap! {
                            "app".to_string() => "cart".to_string(),
                        },
                    },
                },
                resources: None,
            },
        );
        binding.metadata.namespace = Some("shop".to_string());
        binding.status = Some(VirtualDeploymentBindingStatus {
            conditions: vec![BindingCondition {
                type_: "Ready".to_string(),
                status: if active { "True" } else { "False" }.to_string(),
                reason: None,
                message: None,
            }],
        });
        binding
    }

    fn admission(
        bindings: Vec<VirtualDeploymentBinding>,
        with_config: bool,
    ) -> Admission<StaticBindings> {
        let namespaces = ClusterStore::<Namespace>::shared();
        let mut ns = Namespace::default();
        ns.metadata.name = Some("shop".to_string());
        ns.metadata.labels = Some(btreemap! {
            INJECTION_LABEL.to_string() => "enabled".to_string(),
        });
        namespaces.write().apply(ns);

        let services = Store::<Service>::shared();
        let mut svc = Service::default();
        svc.metadata.namespace = Some("shop".to_string());
        svc.metadata.name = Some("cart".to_string());
        svc.spec = Some(ServiceSpec {
            selector: Some(btreemap! {
                "app".to_string() => "cart".to_string(),
            }),
            ..Default::default()
        });
        services.write().apply(svc);

        let config_maps = Store::<ConfigMap>::shared();
        if with_config {
            let mut cm = ConfigMap::default();
            cm.metadata.namespace = Some("mesh-system".to_string());
            cm.metadata.name = Some(k8s::mesh_config::MESH_CONFIG_MAP.to_string());
            cm.data = Some(btreemap! {
                SIDECAR_IMAGE_KEY.to_string() => "mesh/proxy:1.4.0".to_string(),
            });
            config_maps.write().apply(cm);
        }

        let mut reg = Registry::default();
        Admission::new(
            namespaces,
            services,
            config_maps,
            StaticBindings(bindings),
            "mesh-system",
            Metrics::register(&mut reg),
        )
    }

    fn request(pod: serde_json::Value) -> AdmissionRequest {
        let review: Review = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "review-1",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "operation": "CREATE",
                "namespace": "shop",
                "userInfo": {},
                "object": pod,
            },
        }))
        .expect("review must parse");
        review.try_into().expect("review must carry a request")
    }

    fn cart_pod() -> serde_json::Value {
        json!({
            "metadata": {
                "name": "cart-1",
                "labels": {"app": "cart"},
            },
            "spec": {
                "containers": [{"name": "app", "image": "shop/cart:2.0"}],
            },
        })
    }

    /// Re-applies the response patch the way the API server would and
    /// returns the resulting pod.
    fn apply_patch(rsp: &AdmissionResponse, pod: serde_json::Value) -> Pod {
        let mut pod: Pod = serde_json::from_value(pod).expect("pod must parse");
        pod.metadata.namespace = Some("shop".to_string());
        let mut value = serde_json::to_value(&pod).expect("pod must serialize");

        let patch: json_patch::Patch =
            serde_json::from_slice(rsp.patch.as_ref().expect("patch must be present"))
                .expect("patch must parse");
        json_patch::patch(&mut value, &patch).expect("patch must apply");
        serde_json::from_value(value).expect("patched pod must deserialize")
    }

    #[tokio::test]
    async fn matched_pod_is_patched_with_sidecar() {
        let admission = admission(vec![binding(true)], true);
        let rsp = admission.admit(request(cart_pod())).await;
        assert!(rsp.allowed);

        let pod = apply_patch(&rsp, cart_pod());
        let spec = pod.spec.as_ref().expect("pod has a spec");
        assert!(spec
            .containers
            .iter()
            .any(|c| c.name == SIDECAR_CONTAINER_NAME));
        assert!(spec
            .init_containers
            .iter()
            .flatten()
            .any(|c| c.name == INIT_CONTAINER_NAME));

        let annotations = pod.metadata.annotations.expect("audit annotations");
        assert_eq!(
            annotations.get(BINDING_REF_ANNOTATION).map(String::as_str),
            Some("shop/cart-binding"),
        );
        assert_eq!(
            annotations
                .get(VIRTUAL_DEPLOYMENT_ANNOTATION)
                .map(String::as_str),
            Some("vd-cart"),
        );
    }

    #[tokio::test]
    async fn inactive_binding_allows_unmutated() {
        let admission = admission(vec![binding(false)], true);
        let rsp = admission.admit(request(cart_pod())).await;
        assert!(rsp.allowed);
        assert!(rsp.patch.is_none());
    }

    #[tokio::test]
    async fn pod_opt_out_overrides_namespace_label() {
        let admission = admission(vec![binding(true)], true);
        let mut pod = cart_pod();
        pod["metadata"]["labels"][INJECTION_LABEL] = json!("disabled");
        let rsp = admission.admit(request(pod)).await;
        assert!(rsp.allowed);
        assert!(rsp.patch.is_none());
    }

    #[tokio::test]
    async fn unmatched_pod_is_allowed_unmutated() {
        let admission = admission(Vec::new(), true);
        let rsp = admission.admit(request(cart_pod())).await;
        assert!(rsp.allowed);
        assert!(rsp.patch.is_none());
    }

    #[tokio::test]
    async fn missing_sidecar_image_fails_the_request() {
        let admission = admission(vec![binding(true)], false);
        let rsp = admission.admit(request(cart_pod())).await;
        assert!(!rsp.allowed);
    }
}
