use crate::admission::{Admission, ApiBindings, Metrics};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use mesh_injector_controller_k8s_api::{
    mesh_config::MESH_CONFIG_MAP, ConfigMap, Namespace, Service,
};
use mesh_injector_controller_k8s_index::{ClusterStore, Store};
use mesh_injector_controller_rollout::{
    run_version_poller, NamespaceReconciler, NoControlPlane, ProxyVersionSource,
    ServiceReconciler, UpgradeReconciler,
};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "injector", about = "A sidecar injection controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "mesh_injector=info,warn",
        env = "MESH_INJECTOR_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission webhook server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Namespace holding the mesh ConfigMap.
    #[clap(long, default_value = "mesh-system")]
    controller_namespace: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        // The control-plane client is deployment-specific; without one the
        // version poller is not spawned and upgrades are driven by ConfigMap
        // edits alone.
        Self::parse().run(Option::<NoControlPlane>::None).await
    }

    pub async fn run<S>(self, version_source: Option<S>) -> Result<()>
    where
        S: ProxyVersionSource + Send + Sync + 'static,
    {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            controller_namespace,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::default();
        let admission_metrics = Metrics::register(prom.sub_registry_with_prefix("admission"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        // Shared read-through caches for the admission path. Bindings are
        // deliberately absent; the webhook always lists them fresh.
        let namespaces = ClusterStore::<Namespace>::shared();
        let services = Store::<Service>::shared();
        let config_maps = Store::<ConfigMap>::shared();

        let namespace_events = runtime.watch_all::<Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(namespaces.clone(), namespace_events)
                .instrument(info_span!("namespaces")),
        );

        let service_events = runtime.watch_all::<Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(services.clone(), service_events)
                .instrument(info_span!("services")),
        );

        let config_map_events = runtime.watch_all::<ConfigMap>(
            watcher::Config::default().fields(&format!("metadata.name={MESH_CONFIG_MAP}")),
        );
        tokio::spawn(
            kubert::index::namespaced(config_maps.clone(), config_map_events)
                .instrument(info_span!("configmaps")),
        );

        let client = runtime.client();

        let namespace_reconciler =
            Arc::new(NamespaceReconciler::new(client.clone(), services.clone()));
        tokio::spawn(
            namespace_reconciler
                .run()
                .instrument(info_span!("namespace_rollout")),
        );

        let service_reconciler = Arc::new(ServiceReconciler::new(
            client.clone(),
            services.clone(),
            namespaces.clone(),
        ));
        tokio::spawn(
            service_reconciler
                .run()
                .instrument(info_span!("service_rollout")),
        );

        let upgrade_reconciler = Arc::new(UpgradeReconciler::new(client.clone()));
        tokio::spawn(
            upgrade_reconciler
                .run(controller_namespace.clone())
                .instrument(info_span!("proxy_upgrade")),
        );

        if let Some(source) = version_source {
            tokio::spawn(
                run_version_poller(client.clone(), controller_namespace.clone(), source)
                    .instrument(info_span!("version_poll")),
            );
        }

        let admission = Admission::new(
            namespaces,
            services,
            config_maps,
            ApiBindings(client),
            controller_namespace,
            admission_metrics,
        );
        let runtime = runtime.spawn_server(move || admission);

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
