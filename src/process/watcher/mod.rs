//! Process lifecycle-event sources.
//!
//! A watcher emits normalized [`ProcessEvent`]s into a channel handed to
//! [`ProcessWatcher::start`]. Events are informational triggers only: the
//! authoritative process data is re-read from procfs when the table handles
//! an Add. The watcher owns its kernel resources exclusively and signals
//! termination by closing the event channel.

use tokio::sync::mpsc;

pub mod netlink;

pub use netlink::NetlinkProcessWatcher;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("watcher transport: {0}")]
    Transport(#[from] crate::netlink::Error),
    #[error("watcher is already running")]
    AlreadyStarted,
    #[error("watcher is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Add,
    Remove,
}

/// Which source produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchSource {
    Netlink,
}

/// A normalized process lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEvent {
    pub pid: i32,
    pub kind: EventKind,
    pub source: WatchSource,
}

/// A source of process lifecycle events.
///
/// Implementations must close the event channel (by dropping every sender
/// clone) when they terminate, whether through [`ProcessWatcher::stop`] or a
/// fatal error, so downstream consumers detect shutdown by channel closure.
/// `stop` is idempotent and safe to call from any thread.
pub trait ProcessWatcher: Send + Sync {
    /// Begins emitting lifecycle events into `events`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] when the kernel subscription cannot be
    /// established and [`Error::AlreadyStarted`] on a second call.
    fn start(&self, events: mpsc::Sender<ProcessEvent>) -> Result<()>;

    /// Stops emission and releases kernel resources.
    fn stop(&self);
}
