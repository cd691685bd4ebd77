//! Full-duplex relay between a client and its backend.
//!
//! Each direction runs in its own task and reports how it ended on a
//! channel. The relay returns as soon as either direction ends or shutdown
//! is requested; the other task is aborted at that point, which drops its
//! socket halves and closes both connections.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::metrics::{self, Direction};
use crate::shutdown::signalled;

const BUFFER_SIZE: usize = 8192;

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The source of this direction reached end of stream.
    Eof(Direction),
    /// Reading or writing in this direction failed.
    Failed(Direction),
    /// Process shutdown was requested.
    Shutdown,
    /// Both tasks went away without reporting.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub to_backend: u64,
    pub from_backend: u64,
    pub ended_by: RelayEnd,
}

#[derive(Debug)]
struct DirectionOutcome {
    direction: Direction,
    bytes: u64,
    result: io::Result<()>,
}

/// Aborts every task it holds when dropped.
struct AbortOnDrop(Vec<JoinHandle<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Relay bytes between the client halves and the backend halves.
///
/// `route` labels the byte counters. Returns once one direction is done or
/// shutdown is signalled; both halves of both sides are dropped by then.
pub async fn relay<CR, CW, BR, BW>(
    (client_read, client_write): (CR, CW),
    (backend_read, backend_write): (BR, BW),
    route: &str,
    mut shutdown: watch::Receiver<bool>,
) -> RelaySummary
where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    BR: AsyncRead + Unpin + Send + 'static,
    BW: AsyncWrite + Unpin + Send + 'static,
{
    let to_backend = Arc::new(AtomicU64::new(0));
    let from_backend = Arc::new(AtomicU64::new(0));
    let (tx, mut rx) = mpsc::channel(2);

    debug!(route = %route, "Relaying connections");

    let tasks = AbortOnDrop(vec![
        tokio::spawn(copy_direction(
            client_read,
            backend_write,
            Direction::Downstream,
            route.to_string(),
            Arc::clone(&to_backend),
            tx.clone(),
        )),
        tokio::spawn(copy_direction(
            backend_read,
            client_write,
            Direction::Upstream,
            route.to_string(),
            Arc::clone(&from_backend),
            tx,
        )),
    ]);

    let ended_by = tokio::select! {
        outcome = rx.recv() => match outcome {
            Some(DirectionOutcome { direction, bytes, result: Ok(()) }) => {
                debug!(direction = %direction, bytes, "Relay direction reached end of stream");
                RelayEnd::Eof(direction)
            }
            Some(DirectionOutcome { direction, bytes, result: Err(e) }) => {
                debug!(direction = %direction, bytes, error = %e, "Relay direction failed");
                RelayEnd::Failed(direction)
            }
            None => RelayEnd::Aborted,
        },
        _ = signalled(&mut shutdown) => {
            debug!("Relay interrupted by shutdown");
            RelayEnd::Shutdown
        }
    };
    drop(tasks);

    RelaySummary {
        to_backend: to_backend.load(Ordering::Relaxed),
        from_backend: from_backend.load(Ordering::Relaxed),
        ended_by,
    }
}

async fn copy_direction<R, W>(
    mut src: R,
    mut dst: W,
    direction: Direction,
    route: String,
    counter: Arc<AtomicU64>,
    outcome: mpsc::Sender<DirectionOutcome>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    let result = loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = dst.write_all(&buf[..n]).await {
            break Err(e);
        }
        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        metrics::add_bytes(direction, &route, n as u64);
    };

    let _ = outcome
        .send(DirectionOutcome {
            direction,
            bytes: total,
            result,
        })
        .await;
}
