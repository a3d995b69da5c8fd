//! Leader-side service of snapshot requests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use fleet_coord::{path, shutdown, Connection, Event, EventType};
use fleet_state::{paths, ClusterState, SnapshotOutcome};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::listener::{ListenFuture, Listener};

/// Boxed future returned by a [`Snapshotter`]: the label, or an error
/// message that is handed to the requester verbatim.
pub type SnapshotFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

/// The engine that physically snapshots a service.
pub trait Snapshotter: Send + Sync {
    fn snapshot<'a>(&'a self, service_id: &'a str) -> SnapshotFuture<'a>;
}

/// Serves `/snapshot/requests`: one worker per request runs the engine
/// once and records the outcome.
pub struct SnapshotListener {
    state: ClusterState,
    snapshotter: Arc<dyn Snapshotter>,
}

impl SnapshotListener {
    pub fn new(state: ClusterState, snapshotter: Arc<dyn Snapshotter>) -> Self {
        Self { state, snapshotter }
    }

    /// Serve one request until it carries an outcome.
    ///
    /// Returns as soon as the request is answered, by this worker or any
    /// other, so answered requests hold no task and no watch.
    async fn serve(&self, mut shutdown: watch::Receiver<bool>, request_id: String) {
        let mut served = false;

        loop {
            let (request, changed) = match self.state.load_snapshot_request_w(&request_id).await {
                Ok(loaded) => loaded,
                Err(e) if e.is_not_found() => {
                    debug!(%request_id, "snapshot request gone");
                    return;
                }
                Err(e) => {
                    // Retried when the request set next changes.
                    warn!(%request_id, error = %e, "cannot serve snapshot request");
                    return;
                }
            };

            if request.value.outcome() != SnapshotOutcome::Pending {
                debug!(%request_id, "snapshot request answered");
                return;
            }

            if !served {
                served = true;
                let service_id = request.value.service_id.as_str();
                info!(%request_id, %service_id, "taking snapshot");
                let result = tokio::select! {
                    result = self.snapshotter.snapshot(service_id) => result,
                    _ = shutdown::requested(&mut shutdown) => {
                        warn!(%request_id, "shutdown while taking snapshot");
                        return;
                    }
                };
                if let Err(e) = &result {
                    warn!(%request_id, %service_id, error = %e, "snapshot failed");
                }
                if let Err(e) = self.state.complete_snapshot_request(&request_id, result).await {
                    warn!(%request_id, error = %e, "could not record snapshot outcome");
                }
                continue;
            }

            tokio::select! {
                event = changed => match event {
                    Ok(Event { kind: EventType::NodeDeleted, .. }) | Err(_) => return,
                    Ok(_) => {}
                },
                _ = shutdown::requested(&mut shutdown) => return,
            }
        }
    }
}

impl Listener for SnapshotListener {
    fn connection(&self) -> Arc<dyn Connection> {
        self.state.entities().connection().clone()
    }

    fn path(&self, nodes: &[&str]) -> String {
        nodes
            .iter()
            .fold(paths::SNAPSHOT_REQUESTS.to_string(), |acc, node| path::join(&acc, node))
    }

    fn spawn(&self, shutdown: watch::Receiver<bool>, node: String) -> ListenFuture<'_, ()> {
        Box::pin(self.serve(shutdown, node))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use fleet_coord::CoordStore;
    use fleet_state::SnapshotRequest;
    use tokio::sync::oneshot;

    use super::*;
    use crate::listener::listen;

    struct Counting {
        calls: AtomicUsize,
    }

    impl Snapshotter for Counting {
        fn snapshot<'a>(&'a self, service_id: &'a str) -> SnapshotFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(500)).await;
                match service_id {
                    "broken" => Err("disk full".to_string()),
                    id => Ok(format!("{id}-snap")),
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn each_request_is_served_once() {
        let conn: Arc<dyn Connection> = Arc::new(CoordStore::open_in_memory().unwrap().connect());
        let state = ClusterState::init(conn).await.unwrap();
        let engine = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let listener = Arc::new(SnapshotListener::new(state.clone(), engine.clone()));

        let (stop, shutdown) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(listen(shutdown.clone(), ready_tx, listener));
        ready_rx.await.unwrap().unwrap();

        let mut waiting = shutdown.clone();
        assert_eq!(
            state.request_snapshot("web", &mut waiting).await.unwrap(),
            "web-snap"
        );
        let err = state
            .request_snapshot("broken", &mut waiting)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "disk full");

        // Already answered requests are left alone.
        let mut answered = SnapshotRequest::new("db");
        answered.snapshot_label = "old".to_string();
        state.add_snapshot_request(&answered).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            state
                .load_snapshot_request(&answered.id)
                .await
                .unwrap()
                .value
                .snapshot_label,
            "old"
        );

        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn answered_requests_release_their_workers() {
        let conn: Arc<dyn Connection> = Arc::new(CoordStore::open_in_memory().unwrap().connect());
        let state = ClusterState::init(conn).await.unwrap();
        let engine = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let listener = Arc::new(SnapshotListener::new(state.clone(), engine.clone()));

        let (stop, shutdown) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(listen(shutdown.clone(), ready_tx, listener));
        ready_rx.await.unwrap().unwrap();

        let metrics = tokio::runtime::Handle::current().metrics();
        let idle = metrics.num_alive_tasks();

        let mut waiting = shutdown.clone();
        for i in 0..20 {
            let service = format!("svc-{i}");
            assert_eq!(
                state.request_snapshot(&service, &mut waiting).await.unwrap(),
                format!("{service}-snap")
            );
        }
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(metrics.num_alive_tasks(), idle);

        // A new request respawns workers for the old ones, which leave
        // without snapshotting again.
        state.request_snapshot("late", &mut waiting).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.calls.load(Ordering::SeqCst), 21);
        assert_eq!(metrics.num_alive_tasks(), idle);

        stop.send(true).unwrap();
        task.await.unwrap();
    }
}
