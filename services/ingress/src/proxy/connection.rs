//! Per-connection handling.
//!
//! ```text
//! Accepted -> AwaitingHandshake -> RouteResolved -> Relaying -> Closed
//! ```
//!
//! Every byte read from the client while decoding is captured and replayed
//! to the backend verbatim before relaying starts, so the backend sees the
//! exact stream the client sent.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use qumine_proto::{
    read_handshake, read_packet, ConnectionState, DecodeError, PacketPayload, HANDSHAKE_ID,
};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::backend::{self, DEFAULT_CONNECT_TIMEOUT};
use super::listener::ListenerStats;
use super::relay::{self, RelaySummary};
use super::router::{RouteNotFound, RouteTable};
use crate::metrics::{self, ActiveConnection, ErrorKind};

/// Default time a client has to deliver its first packet.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeouts applied to each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Bound on decoding the first packet. Not applied once relaying starts.
    pub handshake_timeout: Duration,
    /// Bound on dialing the backend.
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Accepted,
    AwaitingHandshake,
    RouteResolved,
    Relaying,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Accepted => "accepted",
            SessionPhase::AwaitingHandshake => "awaiting_handshake",
            SessionPhase::RouteResolved => "route_resolved",
            SessionPhase::Relaying => "relaying",
            SessionPhase::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Reasons a connection ends before or instead of relaying.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("reading first packet failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("no handshake received within {0:?}")]
    Timeout(Duration),

    #[error("unexpected packet {packet_id:#04x}, expected handshake or legacy server list ping")]
    UnexpectedPacket { packet_id: i32 },

    #[error(transparent)]
    RouteNotFound(#[from] RouteNotFound),

    #[error("connecting to upstream {backend} failed: {source}")]
    UpstreamConnect {
        backend: String,
        #[source]
        source: io::Error,
    },

    #[error("replaying handshake to upstream {backend} failed: {source}")]
    Replay {
        backend: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Error kind this failure is counted under.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::Decode(e) if e.is_legacy_ping() => {
                ErrorKind::DecodeLegacyServerListPingFailed
            }
            ConnectionError::Decode(_)
            | ConnectionError::Timeout(_)
            | ConnectionError::UnexpectedPacket { .. } => ErrorKind::DecodeHandshakeFailed,
            ConnectionError::RouteNotFound(_) => ErrorKind::NotFound,
            ConnectionError::UpstreamConnect { .. } => ErrorKind::UpstreamConnectionFailed,
            ConnectionError::Replay { .. } | ConnectionError::Io(_) => ErrorKind::InternalError,
        }
    }

    /// The client went quiet or hung up before sending a whole first packet.
    pub fn is_client_gone(&self) -> bool {
        match self {
            ConnectionError::Timeout(_) => true,
            ConnectionError::Decode(e) => e.is_eof(),
            _ => false,
        }
    }
}

/// Reader that keeps a copy of every byte read through it.
#[derive(Debug)]
pub struct TeeReader<R> {
    inner: R,
    captured: Vec<u8>,
}

impl<R> TeeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            captured: Vec::new(),
        }
    }

    pub fn captured(&self) -> &[u8] {
        &self.captured
    }

    pub fn into_parts(self) -> (R, Vec<u8>) {
        (self.inner, self.captured)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            this.captured.extend_from_slice(&buf.filled()[before..]);
        }
        poll
    }
}

/// What the first packet asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FirstPacket {
    hostname: String,
    /// Phase the client moves to next, `None` for an unknown `next_state`.
    next_state: Option<ConnectionState>,
}

/// Decode the first packet of a session in `state`.
async fn read_first_packet<R: AsyncBufRead + Unpin>(
    source: &mut R,
    state: ConnectionState,
) -> Result<FirstPacket, ConnectionError> {
    let packet = read_packet(source, state).await?;
    debug!(packet_length = packet.length, packet_id = packet.packet_id, "Received packet");

    match packet.payload {
        PacketPayload::LegacyServerListPing(ping) => {
            debug!(
                protocol_version = ping.protocol_version,
                hostname = %ping.server_address,
                port = ping.server_port,
                "Decoded legacy server list ping"
            );
            Ok(FirstPacket {
                hostname: ping.server_address,
                next_state: Some(ConnectionState::Status),
            })
        }
        PacketPayload::Raw(data) if packet.packet_id == HANDSHAKE_ID => {
            let handshake = read_handshake(data)?;
            debug!(
                protocol_version = handshake.protocol_version,
                hostname = %handshake.server_address,
                port = handshake.server_port,
                next_state = handshake.next_state,
                "Decoded handshake"
            );
            Ok(FirstPacket {
                hostname: handshake.server_address,
                next_state: ConnectionState::from_next_state(handshake.next_state),
            })
        }
        PacketPayload::Raw(_) => Err(ConnectionError::UnexpectedPacket {
            packet_id: packet.packet_id,
        }),
    }
}

/// Drives one client connection from accept to close.
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    route_table: Arc<RouteTable>,
    config: ConnectionConfig,
    stats: Arc<ListenerStats>,
}

impl ConnectionHandler {
    pub fn new(
        route_table: Arc<RouteTable>,
        config: ConnectionConfig,
        stats: Arc<ListenerStats>,
    ) -> Self {
        Self {
            route_table,
            config,
            stats,
        }
    }

    /// Handle a connection and record how it ended.
    pub async fn serve(
        &self,
        client: TcpStream,
        peer_addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) {
        info!(peer_addr = %peer_addr, "Inbound client connection");
        match self.handle(client, shutdown).await {
            Ok(summary) => {
                info!(
                    peer_addr = %peer_addr,
                    bytes_to_backend = summary.to_backend,
                    bytes_from_backend = summary.from_backend,
                    ended_by = ?summary.ended_by,
                    "Closed client connection"
                );
            }
            Err(e) => {
                let kind = e.kind();
                metrics::record_error(kind);
                if e.is_client_gone() {
                    debug!(peer_addr = %peer_addr, error = %e, "Client left before handshake");
                    return;
                }
                match kind {
                    ErrorKind::NotFound => warn!(peer_addr = %peer_addr, error = %e, "No matching route found"),
                    ErrorKind::DecodeHandshakeFailed | ErrorKind::DecodeLegacyServerListPingFailed => {
                        warn!(peer_addr = %peer_addr, error = %e, error_kind = %kind, "Unreadable first packet")
                    }
                    _ => error!(peer_addr = %peer_addr, error = %e, error_kind = %kind, "Connection failed"),
                }
            }
        }
    }

    /// Run the connection state machine.
    ///
    /// Both sockets are closed when this returns, whatever the outcome.
    pub async fn handle(
        &self,
        client: TcpStream,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RelaySummary, ConnectionError> {
        let mut phase = SessionPhase::Accepted;
        debug!(phase = %phase, "Session started");

        let (client_read, client_write) = client.into_split();
        let mut reader = BufReader::new(TeeReader::new(client_read));
        let mut state = ConnectionState::default();

        phase = SessionPhase::AwaitingHandshake;
        debug!(phase = %phase, "Waiting for first packet");
        let first = match timeout(
            self.config.handshake_timeout,
            read_first_packet(&mut reader, state),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout(self.config.handshake_timeout)),
        };
        let hostname = first.hostname;
        if let Some(next_state) = first.next_state {
            state = next_state;
        }

        let backend = match self.route_table.find_backend(&hostname) {
            Ok(backend) => {
                self.stats.routes_matched.fetch_add(1, Ordering::Relaxed);
                backend
            }
            Err(e) => {
                self.stats.routes_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };
        phase = SessionPhase::RouteResolved;
        debug!(
            phase = %phase,
            hostname = %hostname,
            backend = %backend,
            client_state = ?state,
            "Found matching route"
        );

        let mut upstream = match backend::connect(&backend, self.config.connect_timeout).await {
            Ok(stream) => {
                self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                stream
            }
            Err(source) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                return Err(ConnectionError::UpstreamConnect { backend, source });
            }
        };
        let _active = ActiveConnection::open(&backend);
        info!(backend = %backend, client_state = ?state, "Connected to upstream");

        // Bytes still sitting in the BufReader were captured by the tee, so
        // dropping the buffer loses nothing.
        let (client_read, captured) = reader.into_inner().into_parts();
        if let Err(source) = upstream.write_all(&captured).await {
            return Err(ConnectionError::Replay { backend, source });
        }
        debug!(bytes = captured.len(), "Replayed first packet to upstream");

        phase = SessionPhase::Relaying;
        debug!(phase = %phase, "Relaying connections");
        let summary = relay::relay(
            (client_read, client_write),
            upstream.into_split(),
            &backend,
            shutdown,
        )
        .await;

        self.stats
            .bytes_to_backend
            .fetch_add(summary.to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(summary.from_backend, Ordering::Relaxed);

        phase = SessionPhase::Closed;
        debug!(phase = %phase, "Stopped relaying connections");
        Ok(summary)
    }
}
