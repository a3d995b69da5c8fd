//! fleet-state: cluster state kept in the coordination store.
//!
//! Maps Fleet's entities (services, their scheduled instances, the
//! per-host shadows of those instances, snapshot requests and the global
//! snapshot state) onto coordination store nodes, and provides the
//! optimistic-concurrency primitives everything else mutates them with.
//!
//! # Architecture
//!
//! ```text
//! ClusterState (facade, one per process)
//!   ├── EntityStore (load / load_w / create / update / load_and_update)
//!   │     └── Arc<dyn Connection>
//!   ├── paths (the only place node paths are built)
//!   └── Timeouts (drain, snapshot wait, snapshot poll)
//! ```
//!
//! All entities are JSON-serialized. Every write presents the version read
//! immediately before it; a stale version fails with
//! [`StateError::VersionConflict`] and is never retried here.

pub mod cluster;
pub mod entity;
pub mod error;
pub mod mutation;
pub mod paths;
pub mod snapshot;
pub mod types;

pub use cluster::{ClusterState, Timeouts};
pub use entity::{EntityStore, Versioned};
pub use error::{StateError, StateResult};
pub use mutation::{
    HostStateMutation, Mutation, ServiceMutation, ServiceStateMutation, SnapshotMutation,
};
pub use types::*;
