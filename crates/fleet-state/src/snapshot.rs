//! Snapshot request protocol and the cluster-wide snapshot state.
//!
//! A client creates a request node and waits; the leader serving
//! `/snapshot/requests` writes exactly one of label or error into it. The
//! client never deletes the request while waiting.

use fleet_coord::{shutdown, Watch};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::cluster::ClusterState;
use crate::entity::Versioned;
use crate::error::{StateError, StateResult};
use crate::mutation::{Mutation, SnapshotMutation};
use crate::paths;
use crate::types::{SnapshotOutcome, SnapshotRequest};

impl ClusterState {
    pub async fn add_snapshot_request(&self, request: &SnapshotRequest) -> StateResult<()> {
        let path = paths::snapshot_request(&request.id)?;
        self.entities.create(&path, request).await?;
        info!(request_id = %request.id, service_id = %request.service_id, "snapshot requested");
        Ok(())
    }

    pub async fn load_snapshot_request(
        &self,
        request_id: &str,
    ) -> StateResult<Versioned<SnapshotRequest>> {
        self.entities
            .load(&paths::snapshot_request(request_id)?)
            .await
    }

    pub async fn load_snapshot_request_w(
        &self,
        request_id: &str,
    ) -> StateResult<(Versioned<SnapshotRequest>, Watch)> {
        self.entities
            .load_w(&paths::snapshot_request(request_id)?)
            .await
    }

    /// Wait until the request carries an outcome.
    ///
    /// Returns the label on success and [`StateError::SnapshotFailed`] with
    /// the fulfiller's exact message on failure. Each round reloads the
    /// request with a watch and sleeps until the watch fires or
    /// `snapshot_poll` passes. Gives up with [`StateError::Timeout`] after
    /// `snapshot_wait`.
    pub async fn wait_for_snapshot(
        &self,
        request_id: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StateResult<String> {
        let path = paths::snapshot_request(request_id)?;
        let deadline = Instant::now() + self.timeouts.snapshot_wait;

        loop {
            if shutdown::is_set(shutdown) {
                return Err(StateError::Shutdown {
                    op: "wait_for_snapshot",
                    path,
                });
            }

            let (request, changed) = self.load_snapshot_request_w(request_id).await?;
            match request.value.outcome() {
                SnapshotOutcome::Fulfilled(label) => {
                    info!(%request_id, %label, "snapshot fulfilled");
                    return Ok(label);
                }
                SnapshotOutcome::Failed(message) => {
                    warn!(%request_id, error = %message, "snapshot failed");
                    return Err(StateError::SnapshotFailed {
                        request_id: request_id.to_string(),
                        message,
                    });
                }
                SnapshotOutcome::Pending => {}
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(%path, "timed out waiting for snapshot");
                return Err(StateError::Timeout {
                    op: "wait_for_snapshot",
                    path,
                    waited: self.timeouts.snapshot_wait,
                });
            }

            let nap = self.timeouts.snapshot_poll.min(deadline - now);
            tokio::select! {
                _ = changed => debug!(%path, "snapshot request changed"),
                _ = sleep(nap) => {}
                _ = shutdown::requested(shutdown) => {
                    return Err(StateError::Shutdown {
                        op: "wait_for_snapshot",
                        path,
                    });
                }
            }
        }
    }

    /// Ask the leader to snapshot `service_id` and wait for the label.
    pub async fn request_snapshot(
        &self,
        service_id: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StateResult<String> {
        let request = SnapshotRequest::new(service_id);
        self.add_snapshot_request(&request).await?;
        self.wait_for_snapshot(&request.id, shutdown).await
    }

    /// Record the outcome of serving a request.
    ///
    /// Refuses a request that already has one.
    pub async fn complete_snapshot_request(
        &self,
        request_id: &str,
        result: Result<String, String>,
    ) -> StateResult<Versioned<SnapshotRequest>> {
        let path = paths::snapshot_request(request_id)?;
        let Versioned { mut value, version } = self.load_snapshot_request(request_id).await?;
        if value.outcome() != SnapshotOutcome::Pending {
            return Err(StateError::AlreadyFulfilled { path });
        }
        SnapshotMutation::from_result(result).apply(&mut value);
        let version = self.entities.update(&path, &value, version).await?;
        debug!(%path, "snapshot request completed");
        Ok(Versioned { value, version })
    }

    pub async fn remove_snapshot_request(&self, request_id: &str) -> StateResult<()> {
        let path = paths::snapshot_request(request_id)?;
        let current = self.load_snapshot_request(request_id).await?;
        self.entities.delete(&path, current.version).await
    }

    // ── Snapshot state ────────────────────────────────────────────

    /// Create the snapshot state, overwriting it if it already exists.
    pub async fn add_snapshot_state(&self, status: &str) -> StateResult<()> {
        let path = paths::SNAPSHOT_STATE;
        match self.entities.create(path, &status).await {
            Ok(()) => Ok(()),
            Err(StateError::AlreadyExists { .. }) => {
                let current = self.entities.load::<String>(path).await?;
                self.entities.update(path, &status, current.version).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn snapshot_state(&self) -> StateResult<String> {
        Ok(self.entities.load::<String>(paths::SNAPSHOT_STATE).await?.value)
    }

    /// Overwrite the snapshot state, creating it if absent.
    pub async fn update_snapshot_state(&self, status: &str) -> StateResult<()> {
        let path = paths::SNAPSHOT_STATE;
        if !self.entities.exists(path).await? {
            return self.add_snapshot_state(status).await;
        }
        let current = self.entities.load::<String>(path).await?;
        self.entities.update(path, &status, current.version).await?;
        Ok(())
    }

    /// Delete the snapshot state. Absent is not an error.
    pub async fn remove_snapshot_state(&self) -> StateResult<()> {
        let path = paths::SNAPSHOT_STATE;
        match self.entities.load::<String>(path).await {
            Ok(current) => self.entities.delete(path, current.version).await,
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cluster::tests::cluster;

    fn no_shutdown() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test(start_paused = true)]
    async fn label_is_returned_once_written() {
        let state = cluster().await;
        let (_tx, mut rx) = no_shutdown();

        let request = SnapshotRequest::new("svc");
        state.add_snapshot_request(&request).await.unwrap();

        let fulfiller = state.clone();
        let id = request.id.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            fulfiller
                .complete_snapshot_request(&id, Ok("snap-1".to_string()))
                .await
                .unwrap();
        });

        let started = Instant::now();
        let label = state.wait_for_snapshot(&request.id, &mut rx).await.unwrap();
        assert_eq!(label, "snap-1");
        assert!(started.elapsed() <= Duration::from_secs(3));

        // The request node is left for the leader to clean up.
        assert!(state.load_snapshot_request(&request.id).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn error_is_returned_verbatim() {
        let state = cluster().await;
        let (_tx, mut rx) = no_shutdown();

        let request = SnapshotRequest::new("svc");
        state.add_snapshot_request(&request).await.unwrap();

        let fulfiller = state.clone();
        let id = request.id.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(1500)).await;
            fulfiller
                .complete_snapshot_request(&id, Err("disk full".to_string()))
                .await
                .unwrap();
        });

        let err = state
            .wait_for_snapshot(&request.id, &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::SnapshotFailed { .. }));
        assert_eq!(err.to_string(), "disk full");
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_a_fulfiller() {
        let state = cluster().await;
        let (_tx, mut rx) = no_shutdown();

        let started = Instant::now();
        let err = state.request_snapshot("svc", &mut rx).await.unwrap_err();
        let waited = started.elapsed();

        assert!(err.is_timeout());
        assert!(err.to_string().contains("/snapshot/requests/"));
        assert!(waited >= Duration::from_secs(55) && waited <= Duration::from_secs(65));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_the_wait() {
        let state = cluster().await;
        let (tx, mut rx) = no_shutdown();

        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            tx.send(true).unwrap();
        });

        let started = Instant::now();
        let err = state.request_snapshot("svc", &mut rx).await.unwrap_err();
        assert!(err.is_shutdown());
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn load_errors_abort_the_wait() {
        let state = cluster().await;
        let (_tx, mut rx) = no_shutdown();
        let err = state.wait_for_snapshot("missing", &mut rx).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn a_request_is_completed_once() {
        let state = cluster().await;
        let request = SnapshotRequest::new("svc");
        state.add_snapshot_request(&request).await.unwrap();

        let done = state
            .complete_snapshot_request(&request.id, Ok("snap-1".to_string()))
            .await
            .unwrap();
        assert_eq!(done.value.snapshot_label, "snap-1");
        assert!(done.value.snapshot_error.is_empty());

        let err = state
            .complete_snapshot_request(&request.id, Err("late".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::AlreadyFulfilled { .. }));

        state.remove_snapshot_request(&request.id).await.unwrap();
        assert!(state
            .load_snapshot_request(&request.id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn snapshot_state_is_last_writer_wins() {
        let state = cluster().await;
        assert!(state.snapshot_state().await.unwrap_err().is_not_found());

        state.update_snapshot_state("paused").await.unwrap();
        assert_eq!(state.snapshot_state().await.unwrap(), "paused");

        state.add_snapshot_state("running").await.unwrap();
        assert_eq!(state.snapshot_state().await.unwrap(), "running");

        state.update_snapshot_state("idle").await.unwrap();
        assert_eq!(state.snapshot_state().await.unwrap(), "idle");

        state.remove_snapshot_state().await.unwrap();
        state.remove_snapshot_state().await.unwrap();
        assert!(state.snapshot_state().await.unwrap_err().is_not_found());
    }
}
