//! The listener reconciliation loop.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use fleet_coord::{path, shutdown, Connection, CoordError, Event, EventType};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{ListenError, ListenResult};

/// Boxed future alias for listener hooks.
pub type ListenFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A component that keeps one worker alive per child of a node.
pub trait Listener: Send + Sync + 'static {
    /// Connection the loop watches through.
    fn connection(&self) -> Arc<dyn Connection>;

    /// The watched path with `nodes` appended. `path(&[])` is the watched
    /// node itself.
    fn path(&self, nodes: &[&str]) -> String;

    /// Component-specific readiness check, run after the path exists.
    fn ready(&self) -> ListenFuture<'_, ListenResult<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Cleanup when the loop exits, before workers are told to stop.
    fn done(&self) {}

    /// Worker for child `node`. Must return soon after `shutdown` flips.
    fn spawn(&self, shutdown: watch::Receiver<bool>, node: String) -> ListenFuture<'_, ()>;

    /// Called with the tracked children after every reconciliation pass.
    fn post_process(&self, _processing: &HashSet<String>) {}
}

/// Whether `path` exists. A missing node is `false`.
pub async fn path_exists(conn: &dyn Connection, path: &str) -> ListenResult<bool> {
    match conn.exists(path).await {
        Ok(exists) => Ok(exists),
        Err(CoordError::NoNode { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Block until `target` and all its ancestors exist.
///
/// Watches the children of the deepest existing ancestor, so nothing is
/// polled. Shutdown is checked before every store round trip.
pub async fn wait_ready(
    conn: &dyn Connection,
    target: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> ListenResult<()> {
    path::validate(target)?;

    loop {
        if shutdown::is_set(shutdown) {
            return Err(ListenError::Shutdown);
        }
        if path_exists(conn, target).await? {
            return Ok(());
        }

        let mut missing = target;
        let mut parent = path::parent(target);
        loop {
            if shutdown::is_set(shutdown) {
                return Err(ListenError::Shutdown);
            }
            if path_exists(conn, parent).await? {
                break;
            }
            missing = parent;
            parent = path::parent(parent);
        }

        let changed = match conn.children_w(parent).await {
            Ok((_, watch)) => watch,
            // Ancestor went away again; start over.
            Err(CoordError::NoNode { .. }) => continue,
            Err(e) => return Err(e.into()),
        };
        if path_exists(conn, missing).await? {
            continue;
        }

        debug!(%target, %missing, "waiting for node to appear");
        tokio::select! {
            _ = changed => {}
            _ = shutdown::requested(shutdown) => return Err(ListenError::Shutdown),
        }
    }
}

/// Sends the worker's node on the completion channel when dropped, so a
/// panicking worker is still untracked.
struct Completion {
    node: Option<String>,
    done: mpsc::UnboundedSender<String>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            let _ = self.done.send(node);
        }
    }
}

/// Run `listener` until shutdown or until its node is deleted.
///
/// `ready` resolves exactly once: `Ok` when the loop is live, or the error
/// that kept it from starting. On exit the listener's `done` hook runs,
/// every worker is told to stop, and this returns only after all of them
/// have finished.
pub async fn listen(
    mut shutdown: watch::Receiver<bool>,
    ready: oneshot::Sender<ListenResult<()>>,
    listener: Arc<dyn Listener>,
) {
    let conn = listener.connection();
    let base = listener.path(&[]);

    info!(path = %base, "starting listener");
    let live = match wait_ready(conn.as_ref(), &base, &mut shutdown).await {
        Ok(()) => listener.ready().await,
        Err(e) => Err(e),
    };
    if let Err(e) = live {
        if e.is_shutdown() {
            debug!(path = %base, "listener shut down before it was ready");
        } else {
            error!(path = %base, error = %e, "could not start listener");
        }
        let _ = ready.send(Err(e));
        return;
    }
    let _ = ready.send(Ok(()));

    let (stop_tx, stop_rx) = watch::channel(false);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let mut processing: HashSet<String> = HashSet::new();

    debug!(path = %base, "listener started, waiting for children");
    'watch: loop {
        let (nodes, mut changed) = match conn.children_w(&base).await {
            Ok(watched) => watched,
            Err(e) => {
                error!(path = %base, error = %e, "could not watch children");
                break;
            }
        };

        for node in nodes {
            if !processing.insert(node.clone()) {
                continue;
            }
            debug!(path = %listener.path(&[&node]), "spawning worker");
            let listener = listener.clone();
            let stop = stop_rx.clone();
            let completion = Completion {
                node: Some(node.clone()),
                done: done_tx.clone(),
            };
            tokio::spawn(async move {
                let _completion = completion;
                listener.spawn(stop, node.clone()).await;
                debug!(path = %listener.path(&[&node]), "worker exited");
            });
        }

        listener.post_process(&processing);

        // A finished worker is only respawned once the child set changes.
        loop {
            tokio::select! {
                event = &mut changed => match event {
                    Ok(Event { kind: EventType::NodeDeleted, .. }) => {
                        info!(path = %base, "node removed, shutting down listener");
                        break 'watch;
                    }
                    Ok(event) => {
                        debug!(path = %base, ?event, "children changed");
                        continue 'watch;
                    }
                    Err(_) => {
                        warn!(path = %base, "watch dropped by the store");
                        break 'watch;
                    }
                },
                Some(node) = done_rx.recv() => {
                    debug!(path = %listener.path(&[&node]), "cleaning up");
                    processing.remove(&node);
                    listener.post_process(&processing);
                }
                _ = shutdown::requested(&mut shutdown) => break 'watch,
            }
        }
    }

    info!(path = %base, workers = processing.len(), "listener stopping");
    listener.done();
    let _ = stop_tx.send(true);
    while !processing.is_empty() {
        match done_rx.recv().await {
            Some(node) => {
                processing.remove(&node);
            }
            None => break,
        }
    }
    debug!(path = %base, "listener stopped");
}

/// Run `master`, then every dependent listener once the master is live.
///
/// Dependents never start if the master fails to become ready. Shutdown,
/// or the master exiting on its own, stops everything; this returns only
/// after every listener has unwound. Without a master this idles until
/// shutdown and the dependents never start.
pub async fn start(
    mut shutdown: watch::Receiver<bool>,
    master: Option<Arc<dyn Listener>>,
    listeners: Vec<Arc<dyn Listener>>,
) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (ready_tx, ready_rx) = oneshot::channel();

    let mut master_task = match master {
        Some(master) => tokio::spawn(listen(stop_rx.clone(), ready_tx, master)),
        None => {
            let mut idle = stop_rx.clone();
            tokio::spawn(async move {
                // Nothing ever reports ready.
                let _ready = ready_tx;
                shutdown::requested(&mut idle).await
            })
        }
    };

    let mut dependents = JoinSet::new();
    let mut master_done = false;

    tokio::select! {
        ready = ready_rx => match ready {
            Ok(Ok(())) => {
                debug!(dependents = listeners.len(), "master ready, starting dependents");
                for listener in listeners {
                    let (ready, _) = oneshot::channel();
                    dependents.spawn(listen(stop_rx.clone(), ready, listener));
                }
            }
            Ok(Err(e)) => warn!(error = %e, "master listener did not start, dependents skipped"),
            Err(_) => debug!("master exited before it was ready"),
        },
        _ = &mut master_task => master_done = true,
        _ = shutdown::requested(&mut shutdown) => {}
    }

    if !master_done {
        tokio::select! {
            _ = &mut master_task => master_done = true,
            _ = shutdown::requested(&mut shutdown) => {}
        }
    }

    let _ = stop_tx.send(true);
    if !master_done {
        if let Err(e) = master_task.await {
            error!(error = %e, "master listener task failed");
        }
    }
    while let Some(joined) = dependents.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "dependent listener task failed");
        }
    }
    info!("all listeners stopped");
}
