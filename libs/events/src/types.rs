//! Route event definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::EventError;

/// All event type names as constants.
pub mod event_types {
    pub const ROUTE_ADDED: &str = "route.added";
    pub const ROUTE_UPDATED: &str = "route.updated";
    pub const ROUTE_REMOVED: &str = "route.removed";
}

// =============================================================================
// Identifiers
// =============================================================================

/// Opaque identity of the workload that owns a route.
///
/// For Kubernetes services this is the object UID; static routes use
/// `static:<hostname>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StableId(String);

impl StableId {
    pub fn new(id: impl Into<String>) -> Result<Self, EventError> {
        let id = id.into();
        if id.is_empty() {
            return Err(EventError::EmptyId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StableId {
    type Error = EventError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StableId> for String {
    fn from(id: StableId) -> Self {
        id.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Route Spec
// =============================================================================

/// A validated hostname to backend mapping.
///
/// The hostname is stored lower-cased; the backend is a `host:port` string
/// that is dialed as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RouteSpecFields")]
pub struct RouteSpec {
    hostname: String,
    backend: String,
}

#[derive(Deserialize)]
struct RouteSpecFields {
    hostname: String,
    backend: String,
}

impl TryFrom<RouteSpecFields> for RouteSpec {
    type Error = EventError;

    fn try_from(fields: RouteSpecFields) -> Result<Self, Self::Error> {
        Self::new(fields.hostname, fields.backend)
    }
}

impl RouteSpec {
    pub fn new(hostname: impl Into<String>, backend: impl Into<String>) -> Result<Self, EventError> {
        let hostname = hostname.into();
        let backend = backend.into();
        validate_hostname(&hostname)?;
        validate_backend(&backend)?;
        Ok(Self {
            hostname: hostname.to_lowercase(),
            backend,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }
}

fn validate_hostname(hostname: &str) -> Result<(), EventError> {
    let invalid = |reason| EventError::InvalidHostname {
        hostname: hostname.to_string(),
        reason,
    };
    if hostname.is_empty() {
        return Err(invalid("empty"));
    }
    if hostname.contains('\0') {
        return Err(invalid("contains a NUL byte"));
    }
    if hostname.chars().any(char::is_whitespace) {
        return Err(invalid("contains whitespace"));
    }
    Ok(())
}

fn validate_backend(backend: &str) -> Result<(), EventError> {
    let invalid = |reason| EventError::InvalidBackend {
        backend: backend.to_string(),
        reason,
    };
    let (host, port) = backend.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    if host.is_empty() || host == "[]" {
        return Err(invalid("missing host"));
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err(invalid("IPv6 host must be bracketed"));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid("port must be in 1-65535")),
        Ok(_) => Ok(()),
    }
}

// =============================================================================
// Route Events
// =============================================================================

/// A change to the set of routes, as reported by a watch source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RouteEvent {
    #[serde(rename = "route.added")]
    Added { id: StableId, route: RouteSpec },

    /// The owner may have been replaced, in which case `old_id != new_id`.
    #[serde(rename = "route.updated")]
    Updated {
        old_id: StableId,
        new_id: StableId,
        route: RouteSpec,
    },

    #[serde(rename = "route.removed")]
    Removed { id: StableId },
}

impl RouteEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            RouteEvent::Added { .. } => event_types::ROUTE_ADDED,
            RouteEvent::Updated { .. } => event_types::ROUTE_UPDATED,
            RouteEvent::Removed { .. } => event_types::ROUTE_REMOVED,
        }
    }

    /// Id the route is stored under once the event is applied.
    pub fn id(&self) -> &StableId {
        match self {
            RouteEvent::Added { id, .. } | RouteEvent::Removed { id } => id,
            RouteEvent::Updated { new_id, .. } => new_id,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
