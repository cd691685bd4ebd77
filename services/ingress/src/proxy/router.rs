//! Route table and backend lookup.
//!
//! Maps the stable id of a workload to the hostname it serves and the
//! backend address that serves it. Mutated by route sync, read by every
//! connection handler.
//!
//! - Hostnames are matched case-insensitively
//! - Anything from the first NUL byte of a requested hostname is ignored
//!   (modded clients append metadata there)
//! - Updates are applied atomically; readers never block and never see a
//!   half-applied change

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use qumine_events::{RouteSpec, StableId};
use thiserror::Error;
use tracing::{debug, info};

use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Hostname as typed by players, lower-cased.
    pub frontend: String,
    /// `host:port` dialed for matching connections.
    pub backend: String,
}

impl Route {
    pub fn new(frontend: &str, backend: impl Into<String>) -> Self {
        Self {
            frontend: frontend.to_lowercase(),
            backend: backend.into(),
        }
    }

    /// Normalize a requested hostname for matching.
    ///
    /// - Drop everything from the first NUL byte on
    /// - Convert to lowercase
    pub fn normalize_hostname(hostname: &str) -> String {
        let host = hostname.split('\0').next().unwrap_or_default();
        host.to_lowercase()
    }
}

impl From<RouteSpec> for Route {
    fn from(spec: RouteSpec) -> Self {
        Route::new(spec.hostname(), spec.backend())
    }
}

/// No route serves the requested hostname.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no route found for hostname {hostname:?}")]
pub struct RouteNotFound {
    pub hostname: String,
}

/// Immutable snapshot of route data for lock-free reads.
///
/// Ordered by id so that the first match for a shared hostname does not
/// depend on insertion order.
#[derive(Debug, Default, Clone)]
struct RouteSnapshot {
    by_id: BTreeMap<StableId, Route>,
}

impl RouteSnapshot {
    fn with_upsert(&self, id: StableId, route: Route) -> Self {
        let mut by_id = self.by_id.clone();
        by_id.insert(id, route);
        Self { by_id }
    }

    fn without(&self, id: &StableId) -> Self {
        let mut by_id = self.by_id.clone();
        by_id.remove(id);
        Self { by_id }
    }

    fn find(&self, hostname: &str) -> Option<&Route> {
        self.by_id.values().find(|route| route.frontend == hostname)
    }
}

/// Route table managing all active routes.
///
/// Uses ArcSwap for lock-free atomic updates. Writers go through
/// `rcu`, so concurrent mutations never lose each other's changes.
#[derive(Debug)]
pub struct RouteTable {
    snapshot: ArcSwap<RouteSnapshot>,
}

impl RouteTable {
    /// Create a new empty route table.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
        }
    }

    /// Insert a route, replacing any route already stored under `id`.
    pub fn add(&self, id: StableId, route: Route) {
        info!(id = %id, frontend = %route.frontend, backend = %route.backend, "Adding route");
        self.snapshot
            .rcu(|current| current.with_upsert(id.clone(), route.clone()));
        self.publish_len();
    }

    /// Replace the route stored under `id`.
    ///
    /// Returns `false` and changes nothing when `id` is unknown.
    pub fn update(&self, id: &StableId, route: Route) -> bool {
        let mut applied = false;
        self.snapshot.rcu(|current| {
            applied = current.by_id.contains_key(id);
            if applied {
                Arc::new(current.with_upsert(id.clone(), route.clone()))
            } else {
                Arc::clone(current)
            }
        });
        if applied {
            info!(id = %id, frontend = %route.frontend, backend = %route.backend, "Updated route");
        } else {
            debug!(id = %id, "Update for unknown route ignored");
        }
        applied
    }

    /// Remove the route stored under `id`. Unknown ids are a no-op.
    pub fn remove(&self, id: &StableId) -> bool {
        let mut removed = false;
        self.snapshot.rcu(|current| {
            removed = current.by_id.contains_key(id);
            if removed {
                Arc::new(current.without(id))
            } else {
                Arc::clone(current)
            }
        });
        if removed {
            info!(id = %id, "Removed route");
            self.publish_len();
        }
        removed
    }

    /// Find the backend serving `hostname`.
    pub fn find_backend(&self, hostname: &str) -> Result<String, RouteNotFound> {
        let normalized = Route::normalize_hostname(hostname);
        let snapshot = self.snapshot.load();
        match snapshot.find(&normalized) {
            Some(route) => {
                debug!(hostname = %normalized, backend = %route.backend, "Route matched");
                Ok(route.backend.clone())
            }
            None => Err(RouteNotFound {
                hostname: normalized,
            }),
        }
    }

    /// Get a route by id.
    pub fn get(&self, id: &StableId) -> Option<Route> {
        self.snapshot.load().by_id.get(id).cloned()
    }

    /// Get the total number of routes.
    pub fn len(&self) -> usize {
        self.snapshot.load().by_id.len()
    }

    /// Check if the route table is empty.
    pub fn is_empty(&self) -> bool {
        self.snapshot.load().by_id.is_empty()
    }

    /// All routes, ordered by id.
    pub fn routes(&self) -> Vec<(StableId, Route)> {
        self.snapshot
            .load()
            .by_id
            .iter()
            .map(|(id, route)| (id.clone(), route.clone()))
            .collect()
    }

    fn publish_len(&self) {
        metrics::set_routes(self.len());
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(value: &str) -> StableId {
        StableId::new(value).unwrap()
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(Route::normalize_hostname("Play.Example.COM"), "play.example.com");
        assert_eq!(Route::normalize_hostname("play.test\0FML\0"), "play.test");
        assert_eq!(Route::normalize_hostname("\0FML"), "");
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(host in "[A-Za-z0-9.-]{0,32}", suffix in "[A-Za-z0-9\\x00]{0,8}") {
            let raw = format!("{host}\0{suffix}");
            let once = Route::normalize_hostname(&raw);
            prop_assert_eq!(Route::normalize_hostname(&once), once.clone());
            prop_assert_eq!(once, host.to_ascii_lowercase());
        }
    }

    #[test]
    fn test_add_and_find() {
        let table = RouteTable::new();
        table.add(id("uid-1"), Route::new("Play.Test", "10.0.0.1:25565"));

        assert_eq!(table.find_backend("play.test").unwrap(), "10.0.0.1:25565");
        assert_eq!(table.find_backend("PLAY.test").unwrap(), "10.0.0.1:25565");
        assert_eq!(table.find_backend("play.test\0FML2\0").unwrap(), "10.0.0.1:25565");
    }

    #[test]
    fn test_find_missing_route() {
        let table = RouteTable::new();
        table.add(id("uid-1"), Route::new("play.test", "10.0.0.1:25565"));

        match table.find_backend("other.test") {
            Err(RouteNotFound { hostname }) => assert_eq!(hostname, "other.test"),
            other => panic!("Expected RouteNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_repeated_add_replaces() {
        let table = RouteTable::new();
        table.add(id("uid-1"), Route::new("play.test", "10.0.0.1:25565"));
        table.add(id("uid-1"), Route::new("play.test", "10.0.0.2:25565"));

        assert_eq!(table.len(), 1);
        assert_eq!(table.find_backend("play.test").unwrap(), "10.0.0.2:25565");
    }

    #[test]
    fn test_update_absent_is_noop() {
        let table = RouteTable::new();
        assert!(!table.update(&id("uid-1"), Route::new("play.test", "10.0.0.1:25565")));
        assert!(table.is_empty());

        table.add(id("uid-1"), Route::new("play.test", "10.0.0.1:25565"));
        assert!(table.update(&id("uid-1"), Route::new("lobby.test", "10.0.0.3:25565")));
        assert!(table.find_backend("play.test").is_err());
        assert_eq!(table.find_backend("lobby.test").unwrap(), "10.0.0.3:25565");
    }

    #[test]
    fn test_remove() {
        let table = RouteTable::new();
        table.add(id("uid-1"), Route::new("play.test", "10.0.0.1:25565"));

        assert!(table.remove(&id("uid-1")));
        assert!(!table.remove(&id("uid-1")));
        assert!(table.get(&id("uid-1")).is_none());
        assert!(table.find_backend("play.test").is_err());
    }

    #[test]
    fn test_shared_hostname_falls_back_after_remove() {
        let table = RouteTable::new();
        table.add(id("uid-b"), Route::new("play.test", "10.0.0.2:25565"));
        table.add(id("uid-a"), Route::new("play.test", "10.0.0.1:25565"));

        // Lowest id wins while both exist.
        assert_eq!(table.find_backend("play.test").unwrap(), "10.0.0.1:25565");

        table.remove(&id("uid-a"));
        assert_eq!(table.find_backend("play.test").unwrap(), "10.0.0.2:25565");

        table.remove(&id("uid-b"));
        assert!(table.find_backend("play.test").is_err());
    }

    #[test]
    fn test_routes_listing() {
        let table = RouteTable::new();
        table.add(id("b"), Route::new("b.test", "10.0.0.2:1"));
        table.add(id("a"), Route::new("a.test", "10.0.0.1:1"));

        let ids: Vec<String> = table.routes().into_iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_are_not_lost() {
        let table = Arc::new(RouteTable::new());
        let mut handles = Vec::new();
        for n in 0..32 {
            let table = Arc::clone(&table);
            handles.push(tokio::spawn(async move {
                table.add(
                    id(&format!("uid-{n:02}")),
                    Route::new(&format!("host-{n}.test"), "10.0.0.1:25565"),
                );
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(table.len(), 32);
    }
}
