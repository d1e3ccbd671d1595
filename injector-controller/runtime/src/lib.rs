#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use mesh_injector_controller_core as core;
pub use mesh_injector_controller_inject as inject;
pub use mesh_injector_controller_k8s_api as k8s;
pub use mesh_injector_controller_k8s_index as index;
pub use mesh_injector_controller_rollout as rollout;

mod admission;
mod args;

pub use self::{
    admission::{Admission, ApiBindings, ListBindings, Metrics},
    args::Args,
};
