//! fleet-listen: watch-driven reconciliation for Fleet.
//!
//! A [`Listener`] names a node in the coordination store; [`listen`] keeps
//! exactly one worker running per child of that node and tears everything
//! down cooperatively on shutdown. [`start`] runs a master listener and,
//! once it is live, any number of dependent listeners under one shutdown
//! broadcast.
//!
//! # Architecture
//!
//! ```text
//! start(shutdown, master, dependents)
//!   └── listen(master) ── ready ──► listen(dependent) × N
//!         ├── wait_ready (ancestor barrier)
//!         ├── children_w loop: spawn once per new child
//!         └── on exit: done() → broadcast stop → drain workers
//!
//! SnapshotListener (Listener over /snapshot/requests)
//!   └── one worker per request → Snapshotter → complete_snapshot_request
//! ```

pub mod error;
pub mod leader;
pub mod listener;
pub mod snapshot;

pub use error::{ListenError, ListenResult};
pub use leader::{current_leader, get_host_id, new_host_leader, HostLeader};
pub use listener::{listen, path_exists, start, wait_ready, ListenFuture, Listener};
pub use snapshot::{SnapshotFuture, SnapshotListener, Snapshotter};
