//! fleet-coord: coordination store primitives for Fleet.
//!
//! Everything above this crate talks to the coordination store through the
//! [`Connection`] trait: versioned nodes in a `/`-separated hierarchy,
//! atomic create/delete, and one-shot watches on data and children.
//!
//! # Architecture
//!
//! ```text
//! Connection (trait, object safe)
//!   ├── exists / get / get_w / create / create_sequential
//!   ├── set (version-checked) / delete (version-checked)
//!   └── children / children_w
//!
//! CoordStore (redb-backed tree, shared)
//!   └── Session (one per connect(), implements Connection,
//!                owns ephemeral nodes until dropped)
//!
//! Leader (election recipe over any Connection)
//! ```
//!
//! The in-process `CoordStore` serializes every operation behind a single
//! lock, so reads, writes and watch registration are linearizable.

pub mod connection;
pub mod error;
pub mod event;
pub mod leader;
pub mod path;
pub mod shutdown;
pub mod store;

pub use connection::{create_all, Connection, CoordFuture};
pub use error::{CoordError, CoordResult};
pub use event::{Event, EventType, Watch};
pub use leader::{Election, Leader};
pub use store::{CoordStore, Session};

/// Version stamp assigned by the store to every node.
///
/// Starts at 0 on create and increases by one on every successful `set`.
pub type Version = u64;
