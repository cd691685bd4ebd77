//! Service watch loop.
//!
//! Each cycle lists all services, reconciles them against the routes this
//! watcher has published, then follows the watch stream from the list's
//! resource version. Route changes leave as [`RouteEvent`]s.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use qumine_events::{RouteEvent, RouteSpec, StableId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::client::{watch_error, KubeClient, KubeError};
use super::service::{Service, Translation};
use crate::metrics::{self, ErrorKind};
use crate::shutdown::signalled;
use crate::status::ComponentStatus;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Routes this watcher has published, keyed by service uid.
#[derive(Debug, Default)]
pub struct RouteState {
    routes: HashMap<StableId, RouteSpec>,
}

impl RouteState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Diff a full listing against the published routes.
    pub fn reconcile(&mut self, services: &[Service]) -> Vec<RouteEvent> {
        let mut events = Vec::new();
        let mut seen = HashSet::with_capacity(services.len());

        for service in services {
            if let Some(id) = service.stable_id() {
                seen.insert(id);
            }
            events.extend(self.upsert(service));
        }

        let mut stale: Vec<StableId> = self
            .routes
            .keys()
            .filter(|id| !seen.contains(id))
            .cloned()
            .collect();
        stale.sort();
        for id in stale {
            self.routes.remove(&id);
            events.push(RouteEvent::Removed { id });
        }
        events
    }

    /// Apply one watch event.
    pub fn apply(&mut self, kind: &str, service: &Service) -> Option<RouteEvent> {
        match kind {
            "ADDED" | "MODIFIED" => self.upsert(service),
            "DELETED" => {
                let id = service.stable_id()?;
                self.routes
                    .remove(&id)
                    .map(|_| RouteEvent::Removed { id })
            }
            _ => None,
        }
    }

    fn upsert(&mut self, service: &Service) -> Option<RouteEvent> {
        match service.translate() {
            Translation::Routable { id, route } => match self.routes.get(&id) {
                Some(existing) if *existing == route => None,
                Some(_) => {
                    self.routes.insert(id.clone(), route.clone());
                    Some(RouteEvent::Updated {
                        old_id: id.clone(),
                        new_id: id,
                        route,
                    })
                }
                None => {
                    self.routes.insert(id.clone(), route.clone());
                    Some(RouteEvent::Added { id, route })
                }
            },
            Translation::NotRoutable => self.forget(service),
            Translation::Rejected { kind, reason } => {
                metrics::record_error(kind);
                warn!(
                    service = %service.display_name(),
                    error_kind = %kind,
                    reason = %reason,
                    "Service cannot be routed"
                );
                self.forget(service)
            }
        }
    }

    fn forget(&mut self, service: &Service) -> Option<RouteEvent> {
        let id = service.stable_id()?;
        self.routes
            .remove(&id)
            .map(|_| RouteEvent::Removed { id })
    }
}

fn decode_service(object: serde_json::Value) -> Option<Service> {
    match serde_json::from_value::<Service>(object) {
        Ok(service) => Some(service),
        Err(e) => {
            metrics::record_error(ErrorKind::InternalError);
            warn!(error = %e, "Skipping undecodable service object");
            None
        }
    }
}

/// Why a watch cycle ended.
enum CycleEnd {
    Shutdown,
    SinkClosed,
}

/// Keeps the routing table in sync with annotated services.
pub struct Watcher {
    client: KubeClient,
    state: RouteState,
    events: mpsc::Sender<RouteEvent>,
    status: Arc<ComponentStatus>,
}

impl Watcher {
    pub fn new(
        client: KubeClient,
        events: mpsc::Sender<RouteEvent>,
        status: Arc<ComponentStatus>,
    ) -> Self {
        Self {
            client,
            state: RouteState::new(),
            events,
            status,
        }
    }

    /// Run until shutdown or until nobody consumes the events.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(url = %self.client.services_url(), "Service watcher starting");
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match self.cycle(&mut shutdown, &mut backoff).await {
                Ok(CycleEnd::Shutdown) => break,
                Ok(CycleEnd::SinkClosed) => {
                    info!("Route event sink closed; stopping watcher");
                    break;
                }
                Err(KubeError::Gone) => {
                    debug!("Watch resource version expired; relisting");
                }
                Err(e) => {
                    self.status.set_down();
                    warn!(error = %e, retry_in = ?backoff, "Service watch failed");
                    tokio::select! {
                        _ = signalled(&mut shutdown) => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        self.status.set_down();
        info!("Service watcher stopped");
    }

    async fn publish(&self, events: Vec<RouteEvent>) -> bool {
        for event in events {
            debug!(event_type = event.event_type(), id = %event.id(), "Publishing route event");
            if self.events.send(event).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn cycle(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Duration,
    ) -> Result<CycleEnd, KubeError> {
        let list = tokio::select! {
            _ = signalled(shutdown) => return Ok(CycleEnd::Shutdown),
            list = self.client.list_services() => list?,
        };

        let services: Vec<Service> = list.items.into_iter().filter_map(decode_service).collect();
        let events = self.state.reconcile(&services);
        info!(
            services = services.len(),
            routes = self.state.len(),
            changes = events.len(),
            "Services listed"
        );
        if !self.publish(events).await {
            return Ok(CycleEnd::SinkClosed);
        }
        self.status.set_up();
        *backoff = INITIAL_BACKOFF;

        let mut resource_version = list.metadata.resource_version;
        loop {
            let mut stream = tokio::select! {
                _ = signalled(shutdown) => return Ok(CycleEnd::Shutdown),
                stream = self.client.watch_services(&resource_version) => stream?,
            };

            loop {
                let next = tokio::select! {
                    _ = signalled(shutdown) => return Ok(CycleEnd::Shutdown),
                    next = stream.next_event() => next?,
                };
                let Some(event) = next else {
                    debug!(resource_version = %resource_version, "Watch closed by server; resuming");
                    break;
                };

                match event.kind.as_str() {
                    "ERROR" => return Err(watch_error(&event.object)),
                    "BOOKMARK" => {
                        if let Some(rv) = bookmark_version(&event.object) {
                            resource_version = rv;
                        }
                    }
                    kind => {
                        let Some(service) = decode_service(event.object) else {
                            continue;
                        };
                        if let Some(rv) = &service.metadata.resource_version {
                            resource_version = rv.clone();
                        }
                        if let Some(route_event) = self.state.apply(kind, &service) {
                            if !self.publish(vec![route_event]).await {
                                return Ok(CycleEnd::SinkClosed);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn bookmark_version(object: &serde_json::Value) -> Option<String> {
    object
        .pointer("/metadata/resourceVersion")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}
