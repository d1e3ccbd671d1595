#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Admission-time pod mutation: injection eligibility, pod-to-binding
//! matching, probe rewriting, and the ordered mutator pipeline.

mod eligibility;
mod matching;
mod mutate;
mod probes;

pub use self::{
    eligibility::eligible,
    matching::{match_binding, ServiceGetter},
    mutate::{inject_pod, proxy_log_level, InitContainer, Mutate, ProxyLogLevel, SidecarContainer},
    probes::rewrite_probes,
};
