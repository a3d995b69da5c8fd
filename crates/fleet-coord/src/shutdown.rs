//! Cooperative shutdown signals.
//!
//! Long-running loops take a `watch::Receiver<bool>`. Sending `true`, or
//! dropping every sender, asks them to stop.

use tokio::sync::watch;

/// Resolve once shutdown has been requested.
///
/// Returns immediately if the flag is already set or the sender is gone.
pub async fn requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Non-blocking check of the shutdown flag.
pub fn is_set(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requested_resolves_on_send() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!is_set(&rx));
        tx.send(true).unwrap();
        requested(&mut rx).await;
        assert!(is_set(&rx));
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        requested(&mut rx).await;
        assert!(is_set(&rx));
    }
}
