use mesh_injector_controller_k8s_api::{Labels, Pod, Service, VirtualDeploymentBinding};
use mesh_injector_controller_k8s_index::SharedStore;
use std::sync::Arc;

/// Source of Service objects for selector matching. Cache-backed in
/// production; a plain map in tests.
pub trait ServiceGetter {
    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>>;
}

impl ServiceGetter for SharedStore<Service> {
    fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.read().get(namespace, name)
    }
}

/// Returns the first binding in list order whose target namespace,
/// match-labels, and resolved Service selector are all satisfied by the pod.
///
/// The tie-break is the input order, which follows the API listing and is
/// not guaranteed stable; two bindings matching the same pod are effectively
/// unspecified. A binding whose target Service cannot be found does not
/// match.
pub fn match_binding<'b>(
    pod: &Pod,
    bindings: &'b [VirtualDeploymentBinding],
    services: &impl ServiceGetter,
) -> Option<&'b VirtualDeploymentBinding> {
    let pod_namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let pod_labels = Labels::from(pod.metadata.labels.as_ref());

    bindings.iter().find(|binding| {
        let target = &binding.spec.target.service;
        if binding.target_namespace() != pod_namespace {
            return false;
        }
        if !pod_labels.contains_all(&target.match_labels) {
            return false;
        }
        let Some(service) = services.service(pod_namespace, &target.name) else {
            return false;
        };
        match service.spec.as_ref().and_then(|s| s.selector.as_ref()) {
            Some(selector) => pod_labels.contains_all(selector),
            // A selectorless Service constrains nothing.
            None => true,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_injector_controller_k8s_api::{
        binding::{ServiceRef, Target, VirtualDeploymentBindingSpec},
        ServiceSpec,
    };
    use std::collections::HashMap;

    #[derive(Default)]
    struct Services(HashMap<(String, String), Arc<Service>>);

    impl Services {
        fn with(mut self, namespace: &str, name: &str, selector: &[(&str, &str)]) -> Self {
            let service = Service {
                spec: Some(ServiceSpec {
                    selector: Some(
                        selector
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            };
            self.0.insert(
                (namespace.to_string(), name.to_string()),
                Arc::new(service),
            );
            self
        }
    }

    impl ServiceGetter for Services {
        fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
            self.0
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }
    }

    fn pod(namespace: &str, labels: &[(&str, &str)]) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some(namespace.to_string());
        pod.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        pod
    }

    fn binding(
        name: &str,
        namespace: &str,
        service: &str,
        match_labels: &[(&str, &str)],
    ) -> VirtualDeploymentBinding {
        let mut b = VirtualDeploymentBinding::new(
            name,
            VirtualDeploymentBindingSpec {
                virtual_deployment: format!("vd-{name}"),
                target: Target {
                    service: ServiceRef {
                        name: service.to_string(),
                        namespace: None,
                        match_labels: match_labels
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    },
                },
                resources: None,
            },
        );
        b.metadata.namespace = Some(namespace.to_string());
        b
    }

    #[test]
    fn first_satisfying_binding_wins() {
        let services = Services::default()
            .with("apps", "web", &[("app", "web")])
            .with("apps", "api", &[("app", "api")]);
        let bindings = vec![
            binding("b-api", "apps", "api", &[("app", "api")]),
            binding("b-web-1", "apps", "web", &[("app", "web")]),
            binding("b-web-2", "apps", "web", &[]),
        ];

        let pod = pod("apps", &[("app", "web")]);
        let matched = match_binding(&pod, &bindings, &services).expect("must match");
        assert_eq!(matched.metadata.name.as_deref(), Some("b-web-1"));
    }

    #[test]
    fn non_matching_bindings_do_not_change_the_result() {
        let services = Services::default().with("apps", "web", &[("app", "web")]);
        let pod = pod("apps", &[("app", "web")]);

        let mut bindings = vec![binding("b-web", "apps", "web", &[("app", "web")])];
        let baseline = match_binding(&pod, &bindings, &services)
            .expect("must match")
            .metadata
            .name
            .clone();

        // Wrong namespace, missing match-label, missing service; inserted
        // anywhere in the list.
        bindings.insert(0, binding("b-other-ns", "other", "web", &[]));
        bindings.insert(1, binding("b-labels", "apps", "web", &[("tier", "db")]));
        bindings.push(binding("b-no-svc", "apps", "ghost", &[]));

        let matched = match_binding(&pod, &bindings, &services).expect("must still match");
        assert_eq!(matched.metadata.name, baseline);
    }

    #[test]
    fn service_selector_must_be_satisfied() {
        let services = Services::default().with("apps", "web", &[("app", "web"), ("tier", "fe")]);
        let bindings = vec![binding("b-web", "apps", "web", &[("app", "web")])];

        let unmatched = pod("apps", &[("app", "web")]);
        assert!(match_binding(&unmatched, &bindings, &services).is_none());

        let matched = pod("apps", &[("app", "web"), ("tier", "fe")]);
        assert!(match_binding(&matched, &bindings, &services).is_some());
    }

    #[test]
    fn target_namespace_override_is_honored() {
        let services = Services::default().with("prod", "web", &[]);
        let mut b = binding("b-web", "apps", "web", &[]);
        b.spec.target.service.namespace = Some("prod".to_string());

        let bindings = vec![b];
        assert!(match_binding(&pod("apps", &[]), &bindings, &services).is_none());
        assert!(match_binding(&pod("prod", &[]), &bindings, &services).is_some());
    }
}
