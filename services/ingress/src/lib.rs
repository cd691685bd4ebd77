//! Hostname-routing ingress for Minecraft servers.
//!
//! The proxy reads the first packet of every connection to learn which
//! server the player asked for, picks a backend from the route table and
//! then relays bytes untouched. Routes come from static configuration and
//! from annotated Kubernetes services.

pub mod api;
pub mod config;
pub mod kube;
pub mod metrics;
pub mod proxy;
pub mod shutdown;
pub mod status;
pub mod sync;

pub use proxy::{
    ConnectionConfig, ConnectionHandler, Listener, ListenerConfig, ListenerStats, Route,
    RouteTable,
};
pub use status::{ComponentStatus, Status};
