//! CoordStore: redb-backed, in-process coordination store.
//!
//! Nodes live in a single redb table keyed by absolute path, with the
//! payload, version, ephemeral owner and child sequence counter
//! JSON-encoded into the value column. Watches are held in memory and fired
//! after the write transaction that caused them commits.
//!
//! Every operation runs under one lock, which makes version checks atomic
//! and guarantees that no change is missed between a read and the watch it
//! registers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::connection::{Connection, CoordFuture};
use crate::error::{CoordError, CoordResult};
use crate::event::{Event, EventType, Watch};
use crate::path::{self, ROOT};
use crate::Version;

/// Convert any `Display` error into a `CoordError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| CoordError::$variant(e.to_string())
    };
}

/// Nodes keyed by absolute path.
const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredNode {
    data: Vec<u8>,
    version: Version,
    /// Session that owns this node, for ephemeral nodes.
    #[serde(default)]
    ephemeral_owner: Option<u64>,
    /// Next sequence number handed to a sequential child.
    #[serde(default)]
    next_sequence: u64,
}

fn decode(raw: &[u8]) -> CoordResult<StoredNode> {
    serde_json::from_slice(raw).map_err(map_err!(Serialize))
}

fn encode(node: &StoredNode) -> CoordResult<Vec<u8>> {
    serde_json::to_vec(node).map_err(map_err!(Serialize))
}

/// Names of the direct children of `parent`, in key order.
fn direct_children(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    parent: &str,
) -> CoordResult<Vec<String>> {
    let prefix = path::child_prefix(parent);
    let mut names = Vec::new();
    for entry in table.iter().map_err(map_err!(Storage))? {
        let (key, _) = entry.map_err(map_err!(Storage))?;
        if let Some(rest) = key.value().strip_prefix(prefix.as_str()) {
            if !rest.is_empty() && !rest.contains('/') {
                names.push(rest.to_string());
            }
        }
    }
    Ok(names)
}

/// Pending one-shot watches.
#[derive(Default)]
struct Watches {
    data: HashMap<String, Vec<oneshot::Sender<Event>>>,
    children: HashMap<String, Vec<oneshot::Sender<Event>>>,
}

impl Watches {
    fn watch_data(&mut self, path: &str) -> Watch {
        register(&mut self.data, path)
    }

    fn watch_children(&mut self, path: &str) -> Watch {
        register(&mut self.children, path)
    }

    fn fire_data(&mut self, path: &str, kind: EventType) {
        if let Some(senders) = self.data.remove(path) {
            fire(senders, path, kind);
        }
    }

    fn fire_children(&mut self, path: &str, kind: EventType) {
        if let Some(senders) = self.children.remove(path) {
            fire(senders, path, kind);
        }
    }
}

/// Add a watch on `path`, dropping every watch whose receiver is gone.
fn register(pending: &mut HashMap<String, Vec<oneshot::Sender<Event>>>, path: &str) -> Watch {
    pending.retain(|_, senders| {
        senders.retain(|tx| !tx.is_closed());
        !senders.is_empty()
    });
    let (tx, rx) = oneshot::channel();
    pending.entry(path.to_string()).or_default().push(tx);
    rx
}

fn fire(senders: Vec<oneshot::Sender<Event>>, path: &str, kind: EventType) {
    for tx in senders {
        // Receivers that went away are simply not interested any more.
        let _ = tx.send(Event {
            kind,
            path: path.to_string(),
        });
    }
}

struct Inner {
    db: Database,
    watches: Mutex<Watches>,
    next_session: AtomicU64,
}

/// Shared handle to the coordination store.
#[derive(Clone)]
pub struct CoordStore {
    inner: Arc<Inner>,
}

impl CoordStore {
    /// Open (or create) a persistent store at the given path.
    ///
    /// Ephemeral nodes left behind by a previous process are removed.
    pub fn open(path: &Path) -> CoordResult<Self> {
        let db = Database::create(path).map_err(map_err!(Storage))?;
        let store = Self::from_database(db)?;
        debug!(?path, "coordination store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing and single-process use).
    pub fn open_in_memory() -> CoordResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Storage))?;
        let store = Self::from_database(db)?;
        debug!("in-memory coordination store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> CoordResult<Self> {
        let inner = Inner {
            db,
            watches: Mutex::new(Watches::default()),
            next_session: AtomicU64::new(1),
        };
        inner.ensure_table()?;
        let purged = inner.purge_ephemeral()?;
        if purged > 0 {
            debug!(purged, "removed ephemeral nodes from a previous run");
        }
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Open a new session. Ephemeral nodes created through it are removed
    /// when it is dropped.
    pub fn connect(&self) -> Session {
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "session opened");
        Session {
            store: self.clone(),
            id,
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Watches> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_table(&self) -> CoordResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NODES).map_err(map_err!(Storage))?;
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }

    fn purge_ephemeral(&self) -> CoordResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let count;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Storage))?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(map_err!(Storage))? {
                let (key, value) = entry.map_err(map_err!(Storage))?;
                if decode(value.value())?.ephemeral_owner.is_some() {
                    stale.push(key.value().to_string());
                }
            }
            for key in &stale {
                table.remove(key.as_str()).map_err(map_err!(Storage))?;
            }
            count = stale.len();
        }
        txn.commit().map_err(map_err!(Storage))?;
        Ok(count)
    }

    fn read_node(&self, path: &str) -> CoordResult<Option<StoredNode>> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(NODES).map_err(map_err!(Storage))?;
        match table.get(path).map_err(map_err!(Storage))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn read_children(&self, path: &str) -> CoordResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        let table = txn.open_table(NODES).map_err(map_err!(Storage))?;
        direct_children(&table, path)
    }

    fn exists(&self, path: &str) -> CoordResult<bool> {
        path::validate(path)?;
        if path == ROOT {
            return Ok(true);
        }
        let _guard = self.lock();
        Ok(self.read_node(path)?.is_some())
    }

    fn get(&self, path: &str, watch: bool) -> CoordResult<(Vec<u8>, Version, Option<Watch>)> {
        path::validate(path)?;
        let mut watches = self.lock();
        let node = if path == ROOT {
            StoredNode::default()
        } else {
            self.read_node(path)?.ok_or_else(|| CoordError::NoNode {
                path: path.to_string(),
            })?
        };
        let watch = watch.then(|| watches.watch_data(path));
        Ok((node.data, node.version, watch))
    }

    fn children(&self, path: &str, watch: bool) -> CoordResult<(Vec<String>, Option<Watch>)> {
        path::validate(path)?;
        let mut watches = self.lock();
        if path != ROOT && self.read_node(path)?.is_none() {
            return Err(CoordError::NoNode {
                path: path.to_string(),
            });
        }
        let names = self.read_children(path)?;
        let watch = watch.then(|| watches.watch_children(path));
        Ok((names, watch))
    }

    fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        owner: Option<u64>,
        sequential: bool,
    ) -> CoordResult<String> {
        path::validate(path)?;
        if path == ROOT {
            return Err(CoordError::NodeExists {
                path: path.to_string(),
            });
        }
        let parent = path::parent(path);
        if sequential && parent == ROOT {
            return Err(CoordError::InvalidPath(path.to_string()));
        }

        let mut watches = self.lock();
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let created = {
            let mut table = txn.open_table(NODES).map_err(map_err!(Storage))?;

            let parent_raw = if parent == ROOT {
                None
            } else {
                let raw = table
                    .get(parent)
                    .map_err(map_err!(Storage))?
                    .map(|guard| guard.value().to_vec());
                Some(raw.ok_or_else(|| CoordError::NoNode {
                    path: parent.to_string(),
                })?)
            };

            let full = match parent_raw {
                Some(raw) if sequential => {
                    let mut parent_node = decode(&raw)?;
                    let sequence = parent_node.next_sequence;
                    parent_node.next_sequence += 1;
                    table
                        .insert(parent, encode(&parent_node)?.as_slice())
                        .map_err(map_err!(Storage))?;
                    format!("{path}{sequence:010}")
                }
                _ => path.to_string(),
            };

            if table.get(full.as_str()).map_err(map_err!(Storage))?.is_some() {
                return Err(CoordError::NodeExists { path: full });
            }

            let node = StoredNode {
                data,
                version: 0,
                ephemeral_owner: owner,
                next_sequence: 0,
            };
            table
                .insert(full.as_str(), encode(&node)?.as_slice())
                .map_err(map_err!(Storage))?;
            full
        };
        txn.commit().map_err(map_err!(Storage))?;

        watches.fire_data(&created, EventType::NodeCreated);
        watches.fire_children(parent, EventType::NodeChildrenChanged);
        debug!(path = %created, ephemeral = owner.is_some(), "node created");
        Ok(created)
    }

    fn set(&self, path: &str, data: Vec<u8>, version: Version) -> CoordResult<Version> {
        path::validate(path)?;
        if path == ROOT {
            return Err(CoordError::InvalidPath(path.to_string()));
        }

        let mut watches = self.lock();
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let new_version = {
            let mut table = txn.open_table(NODES).map_err(map_err!(Storage))?;
            let raw = table
                .get(path)
                .map_err(map_err!(Storage))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| CoordError::NoNode {
                    path: path.to_string(),
                })?;
            let mut node = decode(&raw)?;
            if node.version != version {
                return Err(CoordError::BadVersion {
                    path: path.to_string(),
                    expected: version,
                    actual: node.version,
                });
            }
            node.version += 1;
            node.data = data;
            table
                .insert(path, encode(&node)?.as_slice())
                .map_err(map_err!(Storage))?;
            node.version
        };
        txn.commit().map_err(map_err!(Storage))?;

        watches.fire_data(path, EventType::NodeDataChanged);
        Ok(new_version)
    }

    fn delete(&self, path: &str, version: Version) -> CoordResult<()> {
        path::validate(path)?;
        if path == ROOT {
            return Err(CoordError::InvalidPath(path.to_string()));
        }

        let mut watches = self.lock();
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Storage))?;
            let raw = table
                .get(path)
                .map_err(map_err!(Storage))?
                .map(|guard| guard.value().to_vec())
                .ok_or_else(|| CoordError::NoNode {
                    path: path.to_string(),
                })?;
            let node = decode(&raw)?;
            if node.version != version {
                return Err(CoordError::BadVersion {
                    path: path.to_string(),
                    expected: version,
                    actual: node.version,
                });
            }
            if !direct_children(&table, path)?.is_empty() {
                return Err(CoordError::NotEmpty {
                    path: path.to_string(),
                });
            }
            table.remove(path).map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;

        fire_deleted(&mut watches, path);
        debug!(%path, "node deleted");
        Ok(())
    }

    /// Remove every ephemeral node owned by `session`.
    fn expire_session(&self, session: u64) -> CoordResult<Vec<String>> {
        let mut watches = self.lock();
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let mut removed = Vec::new();
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Storage))?;
            for entry in table.iter().map_err(map_err!(Storage))? {
                let (key, value) = entry.map_err(map_err!(Storage))?;
                if decode(value.value())?.ephemeral_owner == Some(session) {
                    removed.push(key.value().to_string());
                }
            }
            for key in &removed {
                table.remove(key.as_str()).map_err(map_err!(Storage))?;
            }
        }
        txn.commit().map_err(map_err!(Storage))?;

        for path in &removed {
            fire_deleted(&mut watches, path);
        }
        Ok(removed)
    }
}

fn fire_deleted(watches: &mut Watches, path: &str) {
    watches.fire_data(path, EventType::NodeDeleted);
    watches.fire_children(path, EventType::NodeDeleted);
    watches.fire_children(path::parent(path), EventType::NodeChildrenChanged);
}

// ── Session ────────────────────────────────────────────────────────

/// A connection to a [`CoordStore`].
///
/// Owns the ephemeral nodes it creates; they are deleted when the session
/// is dropped, firing the usual watches.
pub struct Session {
    store: CoordStore,
    id: u64,
}

impl Session {
    /// Store-assigned session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The store this session is connected to.
    pub fn store(&self) -> &CoordStore {
        &self.store
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        match self.store.inner.expire_session(self.id) {
            Ok(removed) => debug!(session = self.id, ephemeral = removed.len(), "session closed"),
            Err(e) => warn!(session = self.id, error = %e, "failed to expire session"),
        }
    }
}

impl Connection for Session {
    fn exists<'a>(&'a self, path: &'a str) -> CoordFuture<'a, bool> {
        Box::pin(async move { self.store.inner.exists(path) })
    }

    fn get<'a>(&'a self, path: &'a str) -> CoordFuture<'a, (Vec<u8>, Version)> {
        Box::pin(async move {
            let (data, version, _) = self.store.inner.get(path, false)?;
            Ok((data, version))
        })
    }

    fn get_w<'a>(&'a self, path: &'a str) -> CoordFuture<'a, (Vec<u8>, Version, Watch)> {
        Box::pin(async move {
            match self.store.inner.get(path, true)? {
                (data, version, Some(watch)) => Ok((data, version, watch)),
                (_, _, None) => Err(CoordError::Storage(format!("no watch registered on {path}"))),
            }
        })
    }

    fn create<'a>(&'a self, path: &'a str, data: Vec<u8>) -> CoordFuture<'a, ()> {
        Box::pin(async move {
            self.store.inner.create(path, data, None, false)?;
            Ok(())
        })
    }

    fn create_sequential<'a>(
        &'a self,
        prefix: &'a str,
        data: Vec<u8>,
        ephemeral: bool,
    ) -> CoordFuture<'a, String> {
        let owner = ephemeral.then_some(self.id);
        Box::pin(async move { self.store.inner.create(prefix, data, owner, true) })
    }

    fn set<'a>(
        &'a self,
        path: &'a str,
        data: Vec<u8>,
        version: Version,
    ) -> CoordFuture<'a, Version> {
        Box::pin(async move { self.store.inner.set(path, data, version) })
    }

    fn delete<'a>(&'a self, path: &'a str, version: Version) -> CoordFuture<'a, ()> {
        Box::pin(async move { self.store.inner.delete(path, version) })
    }

    fn children<'a>(&'a self, path: &'a str) -> CoordFuture<'a, Vec<String>> {
        Box::pin(async move {
            let (names, _) = self.store.inner.children(path, false)?;
            Ok(names)
        })
    }

    fn children_w<'a>(&'a self, path: &'a str) -> CoordFuture<'a, (Vec<String>, Watch)> {
        Box::pin(async move {
            match self.store.inner.children(path, true)? {
                (names, Some(watch)) => Ok((names, watch)),
                (_, None) => Err(CoordError::Storage(format!("no watch registered on {path}"))),
            }
        })
    }
}
