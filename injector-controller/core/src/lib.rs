#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Scheduling and failure-classification primitives shared by the webhook and
//! the rollout reconcilers.

mod classify;
mod schedule;

pub use self::{
    classify::{ClassifyFailure, FailureClass},
    schedule::{ControllerError, Schedule},
};
