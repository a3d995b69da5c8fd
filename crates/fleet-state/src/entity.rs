//! Versioned entity store.
//!
//! Thin typed layer over a [`Connection`]: entities go in and out as JSON,
//! every read hands back the store version, and every write presents a
//! version. Nothing here retries. A lost race surfaces as
//! [`StateError::VersionConflict`] and the caller decides what to do.

use std::sync::Arc;

use fleet_coord::{create_all, Connection, Version, Watch};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::mutation::Mutation;

/// An entity paired with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// Typed, version-checked access to entities stored as JSON nodes.
#[derive(Clone)]
pub struct EntityStore {
    conn: Arc<dyn Connection>,
}

impl EntityStore {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self { conn }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub async fn load<T: DeserializeOwned>(&self, path: &str) -> StateResult<Versioned<T>> {
        let (data, version) = self
            .conn
            .get(path)
            .await
            .map_err(StateError::coord("load", path))?;
        let value = decode("load", path, &data)?;
        Ok(Versioned { value, version })
    }

    /// Load an entity and leave a one-shot watch on its node.
    pub async fn load_w<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> StateResult<(Versioned<T>, Watch)> {
        let (data, version, watch) = self
            .conn
            .get_w(path)
            .await
            .map_err(StateError::coord("load_w", path))?;
        let value = decode("load_w", path, &data)?;
        Ok((Versioned { value, version }, watch))
    }

    pub async fn create<T: Serialize>(&self, path: &str, value: &T) -> StateResult<()> {
        let data = encode("create", path, value)?;
        self.conn
            .create(path, data)
            .await
            .map_err(StateError::coord("create", path))?;
        debug!(%path, "entity created");
        Ok(())
    }

    /// Overwrite an entity if it is still at `version`. Returns the new version.
    pub async fn update<T: Serialize>(
        &self,
        path: &str,
        value: &T,
        version: Version,
    ) -> StateResult<Version> {
        let data = encode("update", path, value)?;
        let next = self
            .conn
            .set(path, data, version)
            .await
            .map_err(StateError::coord("update", path))?;
        debug!(%path, version = next, "entity updated");
        Ok(next)
    }

    pub async fn delete(&self, path: &str, version: Version) -> StateResult<()> {
        self.conn
            .delete(path, version)
            .await
            .map_err(StateError::coord("delete", path))?;
        debug!(%path, "entity deleted");
        Ok(())
    }

    /// Whether a node exists. Absence is `false`, not an error.
    pub async fn exists(&self, path: &str) -> StateResult<bool> {
        self.conn
            .exists(path)
            .await
            .map_err(StateError::coord("exists", path))
    }

    pub async fn children(&self, path: &str) -> StateResult<Vec<String>> {
        self.conn
            .children(path)
            .await
            .map_err(StateError::coord("children", path))
    }

    pub async fn children_w(&self, path: &str) -> StateResult<(Vec<String>, Watch)> {
        self.conn
            .children_w(path)
            .await
            .map_err(StateError::coord("children_w", path))
    }

    /// Create `path` and any missing ancestors as empty nodes.
    pub async fn ensure_path(&self, path: &str) -> StateResult<()> {
        create_all(self.conn.as_ref(), path)
            .await
            .map_err(StateError::coord("ensure_path", path))
    }

    /// Read, transform, and write back conditioned on the version just read.
    ///
    /// If the node changed in between, the write fails with
    /// [`StateError::VersionConflict`] and the stored value is untouched.
    pub async fn load_and_update<T, M>(&self, path: &str, mutation: M) -> StateResult<Versioned<T>>
    where
        T: Serialize + DeserializeOwned,
        M: Mutation<T>,
    {
        let Versioned { mut value, version } = self.load::<T>(path).await?;
        mutation.apply(&mut value);
        let version = self.update(path, &value, version).await?;
        Ok(Versioned { value, version })
    }
}

fn decode<T: DeserializeOwned>(op: &'static str, path: &str, data: &[u8]) -> StateResult<T> {
    serde_json::from_slice(data).map_err(|e| {
        warn!(%path, error = %e, "malformed entity payload");
        StateError::Malformed {
            op,
            path: path.to_string(),
            reason: e.to_string(),
        }
    })
}

fn encode<T: Serialize>(op: &'static str, path: &str, value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StateError::Encode {
        op,
        path: path.to_string(),
        reason: e.to_string(),
    })
}
