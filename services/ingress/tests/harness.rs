//! Test harness for ingress integration tests.
//!
//! Provides helpers to spawn TCP backends and an ingress listener on
//! loopback, and to build the first packets Minecraft clients send.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use qumine_events::StableId;
use qumine_ingress::{
    ComponentStatus, ConnectionConfig, Listener, ListenerConfig, ListenerStats, Route, RouteTable,
};
use qumine_proto::{put_string, put_varint, HANDSHAKE_ID};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// What a test backend does with an accepted connection.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// Record and echo everything.
    Echo,
    /// Record the first read, then close.
    CloseAfterRead,
}

#[allow(dead_code)]
pub struct TestBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    received: Arc<Mutex<Vec<u8>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TestBackend {
    pub async fn spawn(mode: BackendMode) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let received_clone = Arc::clone(&received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let received = Arc::clone(&received_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                received.lock().unwrap().extend_from_slice(&buf[..n]);
                                                if mode == BackendMode::CloseAfterRead {
                                                    break;
                                                }
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until at least `len` bytes arrived.
    pub async fn wait_for_bytes(&self, len: usize) -> Vec<u8> {
        wait_until(|| self.received.lock().unwrap().len() >= len).await;
        self.received()
    }
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[allow(dead_code)]
pub struct IngressHandle {
    pub listen_addr: SocketAddr,
    pub route_table: Arc<RouteTable>,
    pub status: Arc<ComponentStatus>,
    stats: Arc<ListenerStats>,
    shutdown_tx: watch::Sender<bool>,
    run_handle: Option<JoinHandle<()>>,
}

#[allow(dead_code)]
impl IngressHandle {
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_with(ConnectionConfig::default()).await
    }

    pub async fn spawn_with(connection: ConnectionConfig) -> io::Result<Self> {
        let route_table = Arc::new(RouteTable::new());
        let status = Arc::new(ComponentStatus::new());

        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.connection = connection;
        let listener = Listener::bind(config, Arc::clone(&route_table), Arc::clone(&status)).await?;

        let listen_addr = listener.local_addr()?;
        let stats = listener.stats();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run_handle = tokio::spawn(listener.run(shutdown_rx));

        wait_until(|| status.is_up()).await;

        Ok(Self {
            listen_addr,
            route_table,
            status,
            stats,
            shutdown_tx,
            run_handle: Some(run_handle),
        })
    }

    pub fn add_route(&self, id: &str, hostname: &str, backend: impl Into<String>) {
        self.route_table
            .add(StableId::new(id).unwrap(), Route::new(hostname, backend));
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Signal shutdown and wait for the accept loop to exit.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.run_handle.take() {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("listener did not stop")
                .unwrap();
        }
    }
}

/// Poll `condition` every 10ms for up to two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within 2s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// An address nothing listens on.
#[allow(dead_code)]
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// A framed handshake packet.
#[allow(dead_code)]
pub fn handshake(protocol: i32, host: &str, port: u16, next_state: i32) -> Vec<u8> {
    let mut body = BytesMut::new();
    put_varint(&mut body, HANDSHAKE_ID);
    put_varint(&mut body, protocol);
    put_string(&mut body, host);
    body.extend_from_slice(&port.to_be_bytes());
    put_varint(&mut body, next_state);

    let mut frame = BytesMut::new();
    put_varint(&mut frame, body.len() as i32);
    frame.extend_from_slice(&body);
    frame.to_vec()
}

/// A 1.6 server list ping carrying `MC|PingHost`.
#[allow(dead_code)]
pub fn legacy_ping(protocol: u8, host: &str, port: u32) -> Vec<u8> {
    fn utf16be(value: &str) -> Vec<u8> {
        value.encode_utf16().flat_map(u16::to_be_bytes).collect()
    }

    let channel = "MC|PingHost";
    let host_units = host.encode_utf16().count() as u16;

    let mut out = vec![0xFE, 0x01, 0xFA];
    out.extend_from_slice(&(channel.len() as u16).to_be_bytes());
    out.extend_from_slice(&utf16be(channel));
    out.extend_from_slice(&(7 + 2 * host_units).to_be_bytes());
    out.push(protocol);
    out.extend_from_slice(&host_units.to_be_bytes());
    out.extend_from_slice(&utf16be(host));
    out.extend_from_slice(&port.to_be_bytes());
    out
}
