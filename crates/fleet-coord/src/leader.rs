//! Leader election over the coordination store.
//!
//! Each candidate creates an ephemeral sequential `lead-` node under the
//! election path. The candidate holding the lowest sequence is the leader;
//! everyone else watches only the node immediately ahead of it, so a
//! departure wakes exactly one waiter.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::connection::{create_all, Connection};
use crate::error::{CoordError, CoordResult};
use crate::path;
use crate::shutdown;
use crate::Version;

const NODE_PREFIX: &str = "lead-";

/// Outcome of [`Leader::take_lead`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Election {
    /// This candidate now holds the lead.
    Elected,
    /// Shutdown was requested before the lead was acquired.
    Cancelled,
}

/// A candidate in the election rooted at `path`.
pub struct Leader {
    conn: Arc<dyn Connection>,
    path: String,
    payload: Vec<u8>,
    /// Our `lead-` node while we are a candidate.
    node: Mutex<Option<String>>,
}

impl Leader {
    /// Create a candidate that will advertise `payload` while it leads.
    pub fn new(conn: Arc<dyn Connection>, path: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            conn,
            path: path.into(),
            payload,
            node: Mutex::new(None),
        }
    }

    /// The election path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Enter the election and wait until elected or shut down.
    ///
    /// On cancellation the candidate node is withdrawn before returning.
    pub async fn take_lead(&self, shutdown: &mut watch::Receiver<bool>) -> CoordResult<Election> {
        let node = self.enter().await?;
        let name = path::name(&node).to_string();

        loop {
            let mut candidates = self.conn.children(&self.path).await?;
            candidates.sort();
            let position = candidates
                .iter()
                .position(|c| *c == name)
                .ok_or_else(|| CoordError::NoNode { path: node.clone() })?;

            if position == 0 {
                info!(path = %self.path, %node, "lead acquired");
                return Ok(Election::Elected);
            }

            let ahead = path::join(&self.path, &candidates[position - 1]);
            debug!(path = %self.path, %node, %ahead, "waiting for predecessor");
            let watch = match self.conn.get_w(&ahead).await {
                Ok((_, _, watch)) => watch,
                // Predecessor left between listing and watching.
                Err(CoordError::NoNode { .. }) => continue,
                Err(e) => return Err(e),
            };

            tokio::select! {
                _ = watch => {}
                _ = shutdown::requested(shutdown) => {
                    self.release_lead().await?;
                    return Ok(Election::Cancelled);
                }
            }
        }
    }

    /// Withdraw from the election (or give up the lead).
    pub async fn release_lead(&self) -> CoordResult<()> {
        let Some(node) = self.node.lock().await.take() else {
            return Ok(());
        };
        match self.conn.get(&node).await {
            Ok((_, version)) => match self.conn.delete(&node, version).await {
                Ok(()) | Err(CoordError::NoNode { .. }) => {}
                Err(e) => return Err(e),
            },
            Err(CoordError::NoNode { .. }) => {}
            Err(e) => return Err(e),
        }
        info!(path = %self.path, %node, "lead released");
        Ok(())
    }

    /// Payload and version of whoever currently leads, independent of
    /// whether that is this candidate.
    pub async fn current(&self) -> CoordResult<(Vec<u8>, Version)> {
        let mut candidates = self.conn.children(&self.path).await?;
        candidates.sort();
        let first = candidates.first().ok_or_else(|| CoordError::NoNode {
            path: path::join(&self.path, NODE_PREFIX),
        })?;
        self.conn.get(&path::join(&self.path, first)).await
    }

    async fn enter(&self) -> CoordResult<String> {
        let mut slot = self.node.lock().await;
        if let Some(node) = slot.as_ref() {
            return Ok(node.clone());
        }
        create_all(self.conn.as_ref(), &self.path).await?;
        let prefix = path::join(&self.path, NODE_PREFIX);
        let node = self
            .conn
            .create_sequential(&prefix, self.payload.clone(), true)
            .await?;
        debug!(path = %self.path, %node, "entered election");
        *slot = Some(node.clone());
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CoordStore;
    use std::time::Duration;

    #[tokio::test]
    async fn single_candidate_is_elected() {
        let store = CoordStore::open_in_memory().unwrap();
        let conn: Arc<dyn Connection> = Arc::new(store.connect());
        let (_tx, mut shutdown) = watch::channel(false);

        let leader = Leader::new(conn, "/pools/default/leader", b"host-a".to_vec());
        assert_eq!(leader.take_lead(&mut shutdown).await.unwrap(), Election::Elected);

        let (payload, _) = leader.current().await.unwrap();
        assert_eq!(payload, b"host-a");
    }

    #[tokio::test]
    async fn second_candidate_waits_for_release() {
        let store = CoordStore::open_in_memory().unwrap();
        let (_tx, mut shutdown) = watch::channel(false);

        let first = Leader::new(Arc::new(store.connect()), "/election", b"a".to_vec());
        let second = Arc::new(Leader::new(Arc::new(store.connect()), "/election", b"b".to_vec()));
        first.take_lead(&mut shutdown).await.unwrap();

        let waiting = Arc::clone(&second);
        let mut waiting_shutdown = shutdown.clone();
        let handle =
            tokio::spawn(async move { waiting.take_lead(&mut waiting_shutdown).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert_eq!(second.current().await.unwrap().0, b"a");

        first.release_lead().await.unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), Election::Elected);
        assert_eq!(second.current().await.unwrap().0, b"b");
    }

    #[tokio::test]
    async fn dropped_session_hands_over_the_lead() {
        let store = CoordStore::open_in_memory().unwrap();
        let (_tx, mut shutdown) = watch::channel(false);

        let first = Leader::new(Arc::new(store.connect()), "/election", b"a".to_vec());
        first.take_lead(&mut shutdown).await.unwrap();

        let second = Leader::new(Arc::new(store.connect()), "/election", b"b".to_vec());
        let mut second_shutdown = shutdown.clone();
        let (elected, ()) = tokio::join!(second.take_lead(&mut second_shutdown), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(first);
        });
        assert_eq!(elected.unwrap(), Election::Elected);
    }

    #[tokio::test]
    async fn shutdown_cancels_a_waiting_candidate() {
        let store = CoordStore::open_in_memory().unwrap();
        let (tx, mut shutdown) = watch::channel(false);

        let first = Leader::new(Arc::new(store.connect()), "/election", b"a".to_vec());
        first.take_lead(&mut shutdown).await.unwrap();

        let observer = store.connect();
        let second = Leader::new(Arc::new(store.connect()), "/election", b"b".to_vec());
        let mut second_shutdown = shutdown.clone();
        let (outcome, ()) = tokio::join!(second.take_lead(&mut second_shutdown), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        });

        assert_eq!(outcome.unwrap(), Election::Cancelled);
        assert_eq!(observer.children("/election").await.unwrap().len(), 1);
    }
}
