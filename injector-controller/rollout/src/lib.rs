#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Eviction-driven rollout: the initial-injection, service-change, and
//! proxy-upgrade reconcilers, plus the version poller. All three reconcilers
//! share one eviction/aggregation algorithm and terminate through the typed
//! scheduling decision in the core crate.

mod backoff;
mod evict;
mod namespace;
mod poll;
mod service;
mod upgrade;

pub use self::{
    backoff::Backoff,
    evict::{rollout_pods, EvictOutcome, Evictor, PodEvictor},
    namespace::NamespaceReconciler,
    poll::{run_version_poller, NoControlPlane, ProxyVersionSource},
    service::ServiceReconciler,
    upgrade::{binding_ref, mark_outdated, updated_sidecar_image, UpgradeReconciler},
};

use kube::runtime::controller::Action;
use mesh_injector_controller_core::{ControllerError, Schedule};
use mesh_injector_controller_k8s_api::FULL_SYNC_INTERVAL;
use std::time::Duration;

/// Maps a reconcile result onto the work queue: success and scheduled
/// continuations become explicit requeues, while generic failures propagate
/// so the per-key backoff grows.
pub(crate) fn finish(
    key: &str,
    res: Result<(), ControllerError>,
    backoff: &Backoff,
) -> Result<Action, ControllerError> {
    match Schedule::from_result(res) {
        Schedule::Stop => {
            backoff.reset(key);
            Ok(Action::requeue(FULL_SYNC_INTERVAL))
        }
        Schedule::Immediate { error: None } => {
            backoff.reset(key);
            Ok(Action::requeue(Duration::ZERO))
        }
        Schedule::Immediate { error: Some(error) } => Err(ControllerError::Other(error)),
        Schedule::After(delay) => {
            backoff.reset(key);
            Ok(Action::requeue(delay))
        }
    }
}
