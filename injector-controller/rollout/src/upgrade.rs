use crate::{finish, Backoff, EvictOutcome, Evictor, PodEvictor};
use futures::StreamExt;
use kube::runtime::{controller::Action, watcher, Controller};
use mesh_injector_controller_core::{ClassifyFailure, ControllerError};
use mesh_injector_controller_k8s_api::{
    image_version, mesh_config::MESH_CONFIG_MAP, pod_proxy_version, Api, Client, ConfigMap,
    ListParams, MeshConfig, Namespace, Patch, PatchParams, Pod, ResourceExt,
    VirtualDeploymentBinding, BINDING_REF_ANNOTATION, EVICTION_RETRY, INJECTION_LABEL,
    PROXY_OUTDATED_ANNOTATION,
};
use std::sync::Arc;

/// Rolls every meshed pod over to a new proxy version when the mesh
/// ConfigMap's sidecar image changes.
pub struct UpgradeReconciler<E = PodEvictor> {
    client: Client,
    evictor: E,
    backoff: Backoff,
}

impl UpgradeReconciler {
    pub fn new(client: Client) -> Self {
        let evictor = PodEvictor::new(client.clone());
        Self::with_evictor(client, evictor)
    }
}

impl<E: Evictor + Send + Sync + 'static> UpgradeReconciler<E> {
    pub fn with_evictor(client: Client, evictor: E) -> Self {
        Self {
            client,
            evictor,
            backoff: Backoff::default(),
        }
    }

    /// Watches only the mesh ConfigMap in the controller's namespace.
    pub async fn run(self: Arc<Self>, controller_namespace: String) {
        let config_maps: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), &controller_namespace);
        let config = watcher::Config::default()
            .fields(&format!("metadata.name={MESH_CONFIG_MAP}"));
        Controller::new(config_maps, config)
            .shutdown_on_signal()
            .run(
                |cm, ctx| async move {
                    let key = cm.name_any();
                    let res = ctx.reconcile(&cm).await;
                    finish(&key, res, &ctx.backoff)
                },
                |cm, _error, ctx| Action::requeue(ctx.backoff.delay(&cm.name_any())),
                self.clone(),
            )
            .for_each(|res| async move {
                match res {
                    Ok((cm, _)) => tracing::debug!(config_map = %cm.name, "Reconciled"),
                    Err(error) => tracing::warn!(%error, "Upgrade reconcile failed"),
                }
            })
            .await;
    }

    async fn reconcile(&self, cm: &ConfigMap) -> Result<(), ControllerError> {
        let Some(config) = MeshConfig::from_config_map(cm) else {
            // No sidecar image configured; nothing to upgrade to.
            return Ok(());
        };
        let latest = config.proxy_version().to_string();
        if latest.is_empty() {
            return Ok(());
        }

        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespaces = namespaces
            .list(&ListParams::default().labels(INJECTION_LABEL))
            .await
            .map_err(|e| ControllerError::requeue_after_with(EVICTION_RETRY, e))?
            .items;

        let mut failed = 0usize;
        for ns in &namespaces {
            let ns_name = ns.name_any();
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), &ns_name);
            let pods = match pods.list(&ListParams::default()).await {
                Ok(list) => list.items,
                Err(error) => {
                    tracing::warn!(namespace = %ns_name, %error, "Failed to list pods");
                    failed += 1;
                    continue;
                }
            };

            for pod in &pods {
                match self.upgrade_pod(&ns_name, pod, &latest).await {
                    Ok(Step::Done) => {}
                    Ok(Step::Rejected) => failed += 1,
                    Err(error) => {
                        tracing::warn!(
                            namespace = %ns_name,
                            pod = %pod.name_any(),
                            %error,
                            "Upgrade step failed"
                        );
                        failed += 1;
                    }
                }
            }
        }

        if failed == 0 {
            Ok(())
        } else {
            Err(ControllerError::requeue_after(EVICTION_RETRY))
        }
    }

    /// Handles one pod: skip when current, mark outdated when the binding
    /// reference is unusable, otherwise evict.
    async fn upgrade_pod(&self, namespace: &str, pod: &Pod, latest: &str) -> anyhow::Result<Step> {
        let version = pod_proxy_version(pod);
        if version.is_empty() || version == latest {
            return Ok(Step::Done);
        }
        let name = pod.name_any();

        let Some((binding_ns, binding_name)) = binding_ref(pod) else {
            // Best effort; an already-marked pod is already handled.
            let mut marked = pod.clone();
            if mark_outdated(&mut marked) {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                let patch = serde_json::json!({
                    "metadata": {
                        "annotations": { PROXY_OUTDATED_ANNOTATION: "true" }
                    }
                });
                if let Err(error) = pods
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    tracing::warn!(%namespace, pod = %name, %error, "Failed to mark pod outdated");
                }
            }
            return Ok(Step::Done);
        };

        let bindings: Api<VirtualDeploymentBinding> =
            Api::namespaced(self.client.clone(), &binding_ns);
        match bindings.get(&binding_name).await {
            Ok(_) => match self.evictor.evict(namespace, &name).await? {
                EvictOutcome::Evicted => Ok(Step::Done),
                EvictOutcome::Rejected => Ok(Step::Rejected),
            },
            Err(error) if error.is_not_found() => {
                // Binding gone; nothing to evict for.
                Ok(Step::Done)
            }
            Err(error) => Err(error.into()),
        }
    }
}

/// Outcome of handling one pod during an upgrade pass.
enum Step {
    Done,
    /// The eviction was rejected by a disruption budget.
    Rejected,
}

/// Parses the pod's binding-reference annotation (`namespace/name`);
/// `None` when absent or malformed.
pub fn binding_ref(pod: &Pod) -> Option<(String, String)> {
    let reference = pod
        .metadata
        .annotations
        .as_ref()?
        .get(BINDING_REF_ANNOTATION)?;
    let (namespace, name) = reference.split_once('/')?;
    if namespace.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((namespace.to_string(), name.to_string()))
}

/// Sets the outdated-proxy annotation in place; returns false when the pod
/// is already marked, so no write is issued.
pub fn mark_outdated(pod: &mut Pod) -> bool {
    let annotations = pod.metadata.annotations.get_or_insert_with(Default::default);
    if annotations.contains_key(PROXY_OUTDATED_ANNOTATION) {
        return false;
    }
    annotations.insert(PROXY_OUTDATED_ANNOTATION.to_string(), "true".to_string());
    true
}

/// The image reference the mesh ConfigMap should hold for `latest_version`,
/// or `None` when the stored image is already at that version (no write).
pub fn updated_sidecar_image(cm: &ConfigMap, latest_version: &str) -> Option<String> {
    let config = MeshConfig::from_config_map(cm)?;
    if config.proxy_version() == latest_version {
        return None;
    }
    let image = &config.sidecar_image;
    let tag = image_version(image);
    let repo = if tag.is_empty() {
        image.as_str()
    } else {
        &image[..image.len() - tag.len() - 1]
    };
    Some(format!("{repo}:{latest_version}"))
}
