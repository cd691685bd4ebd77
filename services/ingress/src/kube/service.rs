//! `v1/Service` objects and their translation into routes.
//!
//! Only the fields routing needs are modelled. A service is routable when
//! it carries [`ANNOTATION_HOSTNAME`]; its backend is the cluster IP plus the
//! port named by [`ANNOTATION_PORTNAME`] (default [`DEFAULT_PORT_NAME`]).

use std::collections::BTreeMap;

use qumine_events::{RouteSpec, StableId};
use serde::Deserialize;

use crate::metrics::ErrorKind;

/// Hostname players use to reach the service.
pub const ANNOTATION_HOSTNAME: &str = "qumine-ingress.quhive.io/hostname";

/// Name of the service port to route to.
pub const ANNOTATION_PORTNAME: &str = "qumine-ingress.quhive.io/portname";

pub const DEFAULT_PORT_NAME: &str = "minecraft";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceSpec {
    #[serde(default, rename = "clusterIP")]
    pub cluster_ip: Option<String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicePort {
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default)]
    pub resource_version: String,
}

/// Response of a list call. Items are decoded one by one so a single bad
/// object does not fail the whole list.
#[derive(Debug, Deserialize)]
pub struct ServiceList {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
}

/// What a service means for the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Translation {
    Routable { id: StableId, route: RouteSpec },
    /// No hostname annotation; the service is not ours.
    NotRoutable,
    /// Annotated but unusable; counted under `kind`.
    Rejected { kind: ErrorKind, reason: String },
}

impl Service {
    /// Human readable `namespace/name`.
    pub fn display_name(&self) -> String {
        match &self.metadata.namespace {
            Some(namespace) => format!("{}/{}", namespace, self.metadata.name),
            None => self.metadata.name.clone(),
        }
    }

    pub fn stable_id(&self) -> Option<StableId> {
        StableId::new(self.metadata.uid.clone()).ok()
    }

    pub fn translate(&self) -> Translation {
        let Some(hostname) = self.metadata.annotations.get(ANNOTATION_HOSTNAME) else {
            return Translation::NotRoutable;
        };
        let rejected = |kind, reason: String| Translation::Rejected { kind, reason };

        let Some(id) = self.stable_id() else {
            return rejected(ErrorKind::InternalError, "service has no uid".to_string());
        };

        let port_name = self
            .metadata
            .annotations
            .get(ANNOTATION_PORTNAME)
            .map(String::as_str)
            .unwrap_or(DEFAULT_PORT_NAME);
        let Some(port) = self
            .spec
            .ports
            .iter()
            .find(|p| p.name.as_deref() == Some(port_name))
        else {
            return rejected(
                ErrorKind::NoMatchingPort,
                format!("no port named {port_name:?}"),
            );
        };

        let cluster_ip = match self.spec.cluster_ip.as_deref() {
            None | Some("") | Some("None") => {
                return rejected(
                    ErrorKind::InternalError,
                    "service has no cluster IP".to_string(),
                )
            }
            Some(ip) => ip,
        };

        match RouteSpec::new(hostname.as_str(), join_host_port(cluster_ip, port.port)) {
            Ok(route) => Translation::Routable { id, route },
            Err(e) => rejected(ErrorKind::InternalError, e.to_string()),
        }
    }
}

/// `host:port`, with IPv6 hosts bracketed.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
