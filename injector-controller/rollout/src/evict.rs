use async_trait::async_trait;
use kube::api::EvictParams;
use mesh_injector_controller_core::{ClassifyFailure, ControllerError};
use mesh_injector_controller_k8s_api::{
    pod_has_sidecar, Api, Client, Pod, ResourceExt, EVICTION_RETRY, INJECTION_LABEL,
};
use mesh_injector_controller_inject::eligible;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EvictOutcome {
    Evicted,
    /// The eviction would violate a disruption budget; retried later.
    Rejected,
}

/// Graceful pod removal via the eviction subresource.
#[async_trait]
pub trait Evictor {
    async fn evict(&self, namespace: &str, name: &str) -> Result<EvictOutcome, kube::Error>;
}

#[derive(Clone)]
pub struct PodEvictor {
    client: Client,
}

impl PodEvictor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Evictor for PodEvictor {
    async fn evict(&self, namespace: &str, name: &str) -> Result<EvictOutcome, kube::Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match pods.evict(name, &EvictParams::default()).await {
            Ok(_) => Ok(EvictOutcome::Evicted),
            Err(kube::Error::Api(status)) if status.code == 429 => Ok(EvictOutcome::Rejected),
            Err(error) => Err(error),
        }
    }
}

/// The shared rollout pass: evicts every candidate pod that does not yet
/// carry the sidecar, is injection-eligible, and satisfies the
/// trigger-specific match.
///
/// Per-pod failures never abort the batch; rejections and failures are
/// aggregated into a single scheduled retry so disruption budgets can drain
/// naturally instead of busy-looping.
pub async fn rollout_pods<E, F>(
    pods: &[Pod],
    namespace_label: Option<&str>,
    mut matches: F,
    evictor: &E,
) -> Result<(), ControllerError>
where
    E: Evictor + Sync,
    F: FnMut(&Pod) -> bool,
{
    let mut rejected = 0usize;
    let mut failed = 0usize;

    for pod in pods {
        if pod_has_sidecar(pod) {
            continue;
        }
        let pod_label = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(INJECTION_LABEL))
            .map(String::as_str);
        if !eligible(namespace_label, pod_label) {
            continue;
        }
        if !matches(pod) {
            continue;
        }

        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        match evictor.evict(&namespace, &name).await {
            Ok(EvictOutcome::Evicted) => {
                tracing::info!(%namespace, pod = %name, "Evicted for sidecar rollout");
            }
            Ok(EvictOutcome::Rejected) => {
                tracing::info!(%namespace, pod = %name, "Eviction rejected by disruption budget");
                rejected += 1;
            }
            Err(error) if error.is_not_found() => {
                // Already gone; nothing left to roll out.
            }
            Err(error) => {
                tracing::warn!(%namespace, pod = %name, %error, "Eviction failed");
                failed += 1;
            }
        }
    }

    if rejected == 0 && failed == 0 {
        Ok(())
    } else {
        Err(ControllerError::requeue_after(EVICTION_RETRY))
    }
}
