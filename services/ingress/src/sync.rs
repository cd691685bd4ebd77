//! Route synchronization.
//!
//! Watch sources produce [`RouteEvent`]s; this module is the only place
//! that turns them into route table mutations.

use std::sync::Arc;

use qumine_events::{EventError, RouteEvent, RouteSpec, StableId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::proxy::{Route, RouteTable};
use crate::shutdown::signalled;

/// Prefix of the stable ids given to routes from the command line.
pub const STATIC_ROUTE_PREFIX: &str = "static:";

/// Apply one event to the table.
///
/// An update whose owner changed removes the old id before adding the new
/// one; an update for an id the table has never seen is treated as an add.
pub fn apply_route_event(table: &RouteTable, event: RouteEvent) {
    debug!(event_type = event.event_type(), id = %event.id(), "Applying route event");
    match event {
        RouteEvent::Added { id, route } => table.add(id, route.into()),
        RouteEvent::Updated {
            old_id,
            new_id,
            route,
        } => {
            let route = Route::from(route);
            if old_id == new_id {
                if !table.update(&new_id, route.clone()) {
                    table.add(new_id, route);
                }
            } else {
                table.remove(&old_id);
                table.add(new_id, route);
            }
        }
        RouteEvent::Removed { id } => {
            table.remove(&id);
        }
    }
}

/// Stable id for a route configured on the command line.
pub fn static_route_id(route: &RouteSpec) -> Result<StableId, EventError> {
    StableId::new(format!("{STATIC_ROUTE_PREFIX}{}", route.hostname()))
}

/// Add the routes given on the command line.
pub fn install_static_routes(table: &RouteTable, routes: &[RouteSpec]) -> Result<(), EventError> {
    for route in routes {
        let id = static_route_id(route)?;
        apply_route_event(
            table,
            RouteEvent::Added {
                id,
                route: route.clone(),
            },
        );
    }
    if !routes.is_empty() {
        info!(route_count = routes.len(), "Static routes installed");
    }
    Ok(())
}

/// Apply events from `events` until the channel closes or shutdown.
pub async fn run_route_sync_loop(
    table: Arc<RouteTable>,
    mut events: mpsc::Receiver<RouteEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = signalled(&mut shutdown) => {
                info!("Route sync shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(event) => apply_route_event(&table, event),
                None => {
                    info!("Route event source closed");
                    break;
                }
            },
        }
    }
}
