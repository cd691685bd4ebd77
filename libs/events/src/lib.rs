//! # qumine-events
//!
//! Route events for qumine-ingress.
//!
//! ## Design Principles
//!
//! - Events are produced at the watch boundary, already validated
//! - A route is owned by exactly one workload, identified by a [`StableId`]
//! - Hostnames are normalized once, when the [`RouteSpec`] is built
//!
//! ## Event Types
//!
//! - `route.added`: a workload started routing a hostname
//! - `route.updated`: a workload changed its hostname or backend
//! - `route.removed`: a workload stopped routing

mod error;
mod types;

pub use error::EventError;
pub use types::*;
