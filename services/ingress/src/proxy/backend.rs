//! Backend dialing.
//!
//! One connect attempt per client connection, bounded by a timeout. There
//! is no retry and no fail-over; a hostname maps to exactly one backend.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Connect to `backend`, a `host:port` string resolved at dial time.
pub async fn connect(backend: &str, connect_timeout: Duration) -> io::Result<TcpStream> {
    debug!(backend = %backend, "Connecting to backend");

    let stream = match timeout(connect_timeout, TcpStream::connect(backend)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timeout",
            ))
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}
