use crate::{finish, rollout_pods, Backoff, Evictor, PodEvictor};
use futures::StreamExt;
use kube::runtime::{controller::Action, watcher, Controller};
use mesh_injector_controller_core::{ClassifyFailure, ControllerError, FailureClass};
use mesh_injector_controller_inject::match_binding;
use mesh_injector_controller_k8s_api::{
    Api, Client, ListParams, Namespace, Pod, ResourceExt, Service, VirtualDeploymentBinding,
    INJECTION_LABEL,
};
use mesh_injector_controller_k8s_index::SharedStore;
use std::sync::Arc;

/// Rolls the sidecar out to a namespace when its injection label changes:
/// every eligible, unmeshed pod with a matching active binding is evicted so
/// its replacement passes through the webhook.
pub struct NamespaceReconciler<E = PodEvictor> {
    client: Client,
    services: SharedStore<Service>,
    evictor: E,
    backoff: Backoff,
}

impl NamespaceReconciler {
    pub fn new(client: Client, services: SharedStore<Service>) -> Self {
        let evictor = PodEvictor::new(client.clone());
        Self::with_evictor(client, services, evictor)
    }
}

impl<E: Evictor + Send + Sync + 'static> NamespaceReconciler<E> {
    pub fn with_evictor(client: Client, services: SharedStore<Service>, evictor: E) -> Self {
        Self {
            client,
            services,
            evictor,
            backoff: Backoff::default(),
        }
    }

    pub async fn run(self: Arc<Self>) {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        Controller::new(namespaces, watcher::Config::default())
            .shutdown_on_signal()
            .run(
                |ns, ctx| async move {
                    let key = ns.name_any();
                    let res = ctx.reconcile(&ns).await;
                    finish(&key, res, &ctx.backoff)
                },
                |ns, _error, ctx| Action::requeue(ctx.backoff.delay(&ns.name_any())),
                self.clone(),
            )
            .for_each(|res| async move {
                match res {
                    Ok((ns, _)) => tracing::debug!(namespace = %ns.name, "Reconciled"),
                    Err(error) => tracing::warn!(%error, "Namespace reconcile failed"),
                }
            })
            .await;
    }

    async fn reconcile(&self, ns: &Namespace) -> Result<(), ControllerError> {
        let ns_label = ns
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(INJECTION_LABEL))
            .map(String::as_str);
        if ns_label.is_none() {
            return Ok(());
        }

        let name = ns.name_any();
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &name);
        let pods = pods
            .list(&ListParams::default())
            .await
            .map_err(|e| match e.classify() {
                FailureClass::NotFound => ControllerError::DoNotRequeue,
                _ => ControllerError::Other(e.into()),
            })?
            .items;

        let bindings: Api<VirtualDeploymentBinding> = Api::all(self.client.clone());
        let bindings = bindings
            .list(&ListParams::default())
            .await
            .map_err(|e| ControllerError::Other(e.into()))?
            .items;
        let active: Vec<_> = bindings.into_iter().filter(|b| b.is_active()).collect();

        rollout_pods(
            &pods,
            ns_label,
            |pod| match_binding(pod, &active, &self.services).is_some(),
            &self.evictor,
        )
        .await
    }
}
