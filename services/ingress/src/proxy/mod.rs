//! Minecraft-aware TCP proxy.
//!
//! This module provides:
//! - TCP listener management
//! - Handshake and legacy ping decoding to learn the requested hostname
//! - Hostname routing
//! - Replay of the consumed bytes and full-duplex relaying
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Connection Handler -> Route Table -> Backend
//!                             |                                 ^
//!                             +--- replay captured bytes -------+
//!                             +--- relay ---------------------->+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig, RouteTable};
//!
//! let route_table = Arc::new(RouteTable::new());
//! let status = Arc::new(ComponentStatus::new());
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//!
//! let config = ListenerConfig::new("0.0.0.0:25565".parse()?);
//! let listener = Listener::bind(config, route_table, status).await?;
//! listener.run(shutdown_rx).await;
//! ```

mod backend;
mod connection;
mod listener;
mod relay;
mod router;

pub use backend::{connect, DEFAULT_CONNECT_TIMEOUT};
pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionHandler, SessionPhase, TeeReader,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use listener::{Listener, ListenerConfig, ListenerStats};
pub use relay::{relay, RelayEnd, RelaySummary};
pub use router::{Route, RouteNotFound, RouteTable};
