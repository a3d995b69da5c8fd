//! The `Connection` trait: the coordination store as seen by callers.

use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use crate::error::{CoordError, CoordResult};
use crate::event::Watch;
use crate::path;
use crate::Version;

/// Boxed future alias for connection operations.
pub type CoordFuture<'a, T> = Pin<Box<dyn Future<Output = CoordResult<T>> + Send + 'a>>;

/// A session with the coordination store.
///
/// Object safe so layers above can hold an `Arc<dyn Connection>` and tests
/// can wrap or replace the store.
pub trait Connection: Send + Sync {
    /// Whether a node exists. A missing node is `Ok(false)`, never an error.
    fn exists<'a>(&'a self, path: &'a str) -> CoordFuture<'a, bool>;

    /// Read a node's payload and version.
    fn get<'a>(&'a self, path: &'a str) -> CoordFuture<'a, (Vec<u8>, Version)>;

    /// Read a node and leave a watch on its data.
    fn get_w<'a>(&'a self, path: &'a str) -> CoordFuture<'a, (Vec<u8>, Version, Watch)>;

    /// Create a persistent node. Fails with `NodeExists` if already present
    /// and `NoNode` if the parent is missing.
    fn create<'a>(&'a self, path: &'a str, data: Vec<u8>) -> CoordFuture<'a, ()>;

    /// Create a node named `prefix` + a store-assigned, zero-padded sequence
    /// number. Returns the full path. Ephemeral nodes are removed when the
    /// owning session ends.
    fn create_sequential<'a>(
        &'a self,
        prefix: &'a str,
        data: Vec<u8>,
        ephemeral: bool,
    ) -> CoordFuture<'a, String>;

    /// Overwrite a node's payload if its version is still `version`.
    /// Returns the new version.
    fn set<'a>(&'a self, path: &'a str, data: Vec<u8>, version: Version)
        -> CoordFuture<'a, Version>;

    /// Delete a childless node if its version is still `version`.
    fn delete<'a>(&'a self, path: &'a str, version: Version) -> CoordFuture<'a, ()>;

    /// List the names of a node's direct children.
    fn children<'a>(&'a self, path: &'a str) -> CoordFuture<'a, Vec<String>>;

    /// List children and leave a watch on the child set.
    fn children_w<'a>(&'a self, path: &'a str) -> CoordFuture<'a, (Vec<String>, Watch)>;
}

/// Create `path` and any missing ancestors with empty payloads.
///
/// Nodes created concurrently by someone else are fine.
pub async fn create_all(conn: &dyn Connection, target: &str) -> CoordResult<()> {
    path::validate(target)?;
    if target == path::ROOT {
        return Ok(());
    }

    let mut current = String::new();
    for segment in target[1..].split('/') {
        current.push('/');
        current.push_str(segment);
        if conn.exists(&current).await? {
            continue;
        }
        match conn.create(&current, Vec::new()).await {
            Ok(()) => debug!(path = %current, "created node"),
            Err(CoordError::NodeExists { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
