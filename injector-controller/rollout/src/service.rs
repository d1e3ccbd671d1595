use crate::{finish, rollout_pods, Backoff, Evictor, PodEvictor};
use futures::StreamExt;
use kube::runtime::{controller::Action, watcher, Controller};
use mesh_injector_controller_core::{ClassifyFailure, ControllerError, FailureClass};
use mesh_injector_controller_inject::match_binding;
use mesh_injector_controller_k8s_api::{
    Api, Client, ListParams, Namespace, Pod, ResourceExt, Service, VirtualDeploymentBinding,
    INJECTION_LABEL,
};
use mesh_injector_controller_k8s_index::{SharedClusterStore, SharedStore};
use std::sync::Arc;

/// Re-evaluates injection when a Service's selector changes: pods that now
/// fall under a binding targeting that Service are evicted so the webhook
/// injects them on reschedule.
pub struct ServiceReconciler<E = PodEvictor> {
    client: Client,
    services: SharedStore<Service>,
    namespaces: SharedClusterStore<Namespace>,
    evictor: E,
    backoff: Backoff,
}

impl ServiceReconciler {
    pub fn new(
        client: Client,
        services: SharedStore<Service>,
        namespaces: SharedClusterStore<Namespace>,
    ) -> Self {
        let evictor = PodEvictor::new(client.clone());
        Self::with_evictor(client, services, namespaces, evictor)
    }
}

impl<E: Evictor + Send + Sync + 'static> ServiceReconciler<E> {
    pub fn with_evictor(
        client: Client,
        services: SharedStore<Service>,
        namespaces: SharedClusterStore<Namespace>,
        evictor: E,
    ) -> Self {
        Self {
            client,
            services,
            namespaces,
            evictor,
            backoff: Backoff::default(),
        }
    }

    pub async fn run(self: Arc<Self>) {
        let services: Api<Service> = Api::all(self.client.clone());
        Controller::new(services, watcher::Config::default())
            .shutdown_on_signal()
            .run(
                |svc, ctx| async move {
                    let key = format!(
                        "{}/{}",
                        svc.namespace().unwrap_or_default(),
                        svc.name_any()
                    );
                    let res = ctx.reconcile(&svc).await;
                    finish(&key, res, &ctx.backoff)
                },
                |svc, _error, ctx| {
                    let key = format!(
                        "{}/{}",
                        svc.namespace().unwrap_or_default(),
                        svc.name_any()
                    );
                    Action::requeue(ctx.backoff.delay(&key))
                },
                self.clone(),
            )
            .for_each(|res| async move {
                match res {
                    Ok((svc, _)) => tracing::debug!(service = %svc.name, "Reconciled"),
                    Err(error) => tracing::warn!(%error, "Service reconcile failed"),
                }
            })
            .await;
    }

    async fn reconcile(&self, svc: &Service) -> Result<(), ControllerError> {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_any();

        let bindings: Api<VirtualDeploymentBinding> = Api::all(self.client.clone());
        let bindings = bindings
            .list(&ListParams::default())
            .await
            .map_err(|e| ControllerError::Other(e.into()))?
            .items;
        let for_service = bindings_for_service(bindings, &namespace, &name);
        if for_service.is_empty() {
            return Ok(());
        }

        let ns = self.namespaces.read().get(&namespace);
        let ns_label = ns
            .as_ref()
            .and_then(|ns| ns.metadata.labels.as_ref())
            .and_then(|l| l.get(INJECTION_LABEL))
            .cloned();

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let pods = pods
            .list(&ListParams::default())
            .await
            .map_err(|e| match e.classify() {
                FailureClass::NotFound => ControllerError::DoNotRequeue,
                _ => ControllerError::Other(e.into()),
            })?
            .items;

        rollout_pods(
            &pods,
            ns_label.as_deref(),
            |pod| match_binding(pod, &for_service, &self.services).is_some(),
            &self.evictor,
        )
        .await
    }
}

/// Active bindings whose target resolves to the given Service.
fn bindings_for_service(
    bindings: Vec<VirtualDeploymentBinding>,
    namespace: &str,
    name: &str,
) -> Vec<VirtualDeploymentBinding> {
    bindings
        .into_iter()
        .filter(|b| {
            b.is_active()
                && b.spec.target.service.name == name
                && b.target_namespace() == namespace
        })
        .collect()
}
