//! Process-wide shutdown signal.

use tokio::sync::watch;

/// Resolve once `shutdown` reads true or its sender is gone.
///
/// Returns `()` so `select!` arms built on it hold no borrow of the channel
/// value across later awaits.
pub async fn signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
