//! TCP listener and accept loop.
//!
//! Every accepted socket is handed to its own task running a
//! [`ConnectionHandler`]. Accept errors never end the loop; only shutdown
//! does.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, Instrument};

use super::connection::{ConnectionConfig, ConnectionHandler};
use super::router::RouteTable;
use crate::shutdown::signalled;
use crate::status::ComponentStatus;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Per-connection timeouts.
    pub connection: ConnectionConfig,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Routing successes.
    pub routes_matched: AtomicU64,
    /// Hostnames with no route.
    pub routes_failed: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

/// The public Minecraft listener.
pub struct Listener {
    listener: TcpListener,
    handler: ConnectionHandler,
    status: Arc<ComponentStatus>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(
        config: ListenerConfig,
        route_table: Arc<RouteTable>,
        status: Arc<ComponentStatus>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            handshake_timeout_ms = config.connection.handshake_timeout.as_millis() as u64,
            connect_timeout_ms = config.connection.connect_timeout.as_millis() as u64,
            "Listener bound"
        );

        let stats = Arc::new(ListenerStats::default());
        Ok(Self {
            listener,
            handler: ConnectionHandler::new(route_table, config.connection, Arc::clone(&stats)),
            status,
            stats,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics. The handle outlives [`Listener::run`].
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `shutdown` flips to true.
    ///
    /// Status is up for as long as the loop runs. The listening socket is
    /// closed when this returns. Connections already being relayed receive
    /// the same shutdown signal and wind down on their own.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Self {
            listener,
            handler,
            status,
            stats,
        } = self;
        let local_addr = listener.local_addr().ok();
        info!(bind_addr = ?local_addr, "Listener started");
        status.set_up();

        let connection_shutdown = shutdown.clone();
        loop {
            let accept_result = tokio::select! {
                biased;

                _ = signalled(&mut shutdown) => {
                    info!("Listener shutting down");
                    break;
                }
                accept_result = listener.accept() => accept_result,
            };

            match accept_result {
                Ok((stream, peer_addr)) => {
                    stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    stats.connections_active.fetch_add(1, Ordering::Relaxed);

                    let handler = handler.clone();
                    let stats = Arc::clone(&stats);
                    let shutdown = connection_shutdown.clone();

                    tokio::spawn(
                        async move {
                            handler.serve(stream, peer_addr, shutdown).await;

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::select! {
                        _ = signalled(&mut shutdown) => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        drop(listener);
        status.set_down();
        info!(bind_addr = ?local_addr, "Listener closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new("0.0.0.0:25565".parse().unwrap());
        assert_eq!(config.connection, ConnectionConfig::default());
    }

    #[tokio::test]
    async fn test_listener_status_follows_run() {
        let status = Arc::new(ComponentStatus::new());
        let listener = Listener::bind(
            ListenerConfig::new("127.0.0.1:0".parse().unwrap()),
            Arc::new(RouteTable::new()),
            Arc::clone(&status),
        )
        .await
        .unwrap();
        assert_eq!(status.status(), Status::Down);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(listener.run(rx));

        tokio::time::timeout(Duration::from_secs(1), async {
            while !status.is_up() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.status(), Status::Down);
    }

    #[tokio::test]
    async fn test_socket_closed_after_run_returns() {
        let listener = Listener::bind(
            ListenerConfig::new("127.0.0.1:0".parse().unwrap()),
            Arc::new(RouteTable::new()),
            Arc::new(ComponentStatus::new()),
        )
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = listener.stats();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(listener.run(rx));

        let _accepted = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while stats.connections_accepted.load(Ordering::Relaxed) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
