//! Kubernetes service discovery.
//!
//! Services annotated with [`ANNOTATION_HOSTNAME`] become routes to their
//! cluster IP. The [`Watcher`] lists and watches `v1/services` and emits
//! [`qumine_events::RouteEvent`]s for the route sync loop.

mod client;
mod service;
mod watcher;

pub use client::{KubeClient, KubeClientConfig, KubeError, WatchEvent, WatchLines};
pub use service::{
    join_host_port, Service, ServiceList, Translation, ANNOTATION_HOSTNAME, ANNOTATION_PORTNAME,
    DEFAULT_PORT_NAME,
};
pub use watcher::{RouteState, Watcher};
