//! Watch notifications.

use tokio::sync::oneshot;

/// One-shot notification channel returned by the `..._w` operations.
///
/// Fires at most once. If the store goes away before the watched change
/// happens the receiver resolves to an error.
pub type Watch = oneshot::Receiver<Event>;

/// Kind of change that fired a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// A fired watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    /// The watched path (not the child that changed).
    pub path: String,
}
