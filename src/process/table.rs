use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, RwLock};

use crate::procfs::{self, Proc, ProcFs};

use super::watcher::{self, EventKind, ProcessWatcher};
use super::Process;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Procfs(#[from] procfs::Error),
    #[error(transparent)]
    Watcher(#[from] watcher::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Change notification emitted to table subscribers. Remove events carry the
/// last known snapshot of the departed process.
#[derive(Debug, Clone)]
pub struct TableEvent {
    pub kind: EventKind,
    pub process: Process,
}

/// Token returned by [`Table::listen`]; hand it back to
/// [`Table::stop_listening`] to detach. Subscribers hold only this token,
/// never a reference back into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerToken(u64);

/// The authoritative keyed store of live processes.
///
/// `start` seeds the table from a full procfs enumeration and then keeps it
/// current from the watcher's event stream. Subscribers attached before
/// `start` observe the enumeration as Add events; later subscribers see only
/// subsequent changes.
///
/// The record map is guarded by a mutex held only across individual
/// operations; the subscriber map is guarded by a reader-writer lock that is
/// read-held during fan-out. Notification sends are awaited, so a slow
/// subscriber backpressures the table rather than losing events.
pub struct Table {
    data: Mutex<HashMap<i32, Process>>,
    listeners: RwLock<HashMap<u64, mpsc::Sender<TableEvent>>>,
    next_listener_id: AtomicU64,
    procfs: ProcFs,
    watcher: Option<Arc<dyn ProcessWatcher>>,
    started: AtomicBool,
    stopped: AtomicBool,
    event_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Table {
    /// Creates a table over `procfs`, optionally fed by `watcher`. Without a
    /// watcher the table only ever holds the `start` enumeration.
    pub fn new(procfs: ProcFs, watcher: Option<Arc<dyn ProcessWatcher>>) -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(0),
            procfs,
            watcher,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            event_task: Mutex::new(None),
        }
    }

    /// Enumerates all live processes into the table, then attaches to the
    /// watcher. A record that fails to construct (the process exited while
    /// being read) is skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Procfs`] when the enumeration itself fails and
    /// [`Error::Watcher`] when the watcher subscription cannot be
    /// established.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for proc in self.procfs.all_procs()? {
            let pid = proc.pid();
            if let Err(err) = self.add_proc(&proc).await {
                log::warn!("ignoring process {pid}: {err}");
            }
        }

        let Some(watcher) = &self.watcher else {
            return Ok(());
        };

        let (tx, mut rx) = mpsc::channel(1);
        watcher.start(tx)?;

        let table = Arc::clone(self);
        let handle = tokio::spawn(async move {
            // The watcher closes the events channel when it is done.
            while let Some(event) = rx.recv().await {
                match event.kind {
                    EventKind::Add => {
                        if let Err(err) = table.add_pid(event.pid).await {
                            log::warn!("ignoring process {}: {err}", event.pid);
                        }
                    }
                    EventKind::Remove => table.remove(event.pid).await,
                }
            }
            log::debug!("process table event loop finished");
        });
        *self
            .event_task
            .lock()
            .expect("table event task lock poisoned") = Some(handle);

        Ok(())
    }

    /// Stops the watcher, waits for the event loop to drain, and detaches
    /// every subscriber (closing their channels). Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(watcher) = &self.watcher {
            // The stop joins the watcher's socket thread, which blocks until
            // its receive timeout fires; keep that off the async workers.
            let watcher = Arc::clone(watcher);
            if tokio::task::spawn_blocking(move || watcher.stop())
                .await
                .is_err()
            {
                log::error!("watcher stop task panicked");
            }
        }

        let handle = self
            .event_task
            .lock()
            .expect("table event task lock poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.await.is_err() {
                log::error!("process table event loop panicked");
            }
        }

        self.listeners.write().await.clear();
    }

    /// Reads the process's attributes from procfs and installs the record.
    ///
    /// # Errors
    ///
    /// Returns [`procfs::Error::NotFound`] when the PID is already gone.
    pub async fn add_pid(&self, pid: i32) -> procfs::Result<()> {
        let proc = self.procfs.proc(pid)?;
        self.add_proc(&proc).await
    }

    /// Adds or refreshes the record for `proc`.
    ///
    /// A second add with the same `(pid, starttime)` identity is a no-op. A
    /// different identity means the PID was reused: the new record supplants
    /// the old one and subscribers observe a synthetic Remove for the old
    /// process followed by the Add.
    pub async fn add_proc(&self, proc: &Proc) -> procfs::Result<()> {
        let process = Process::new(proc)?;

        let replaced = {
            let mut data = self.data.lock().expect("table data lock poisoned");
            match data.get(&process.pid) {
                Some(existing) if existing.is_same_process(&process) => return Ok(()),
                Some(existing) => {
                    let old = existing.clone();
                    data.insert(process.pid, process.clone());
                    Some(old)
                }
                None => {
                    data.insert(process.pid, process.clone());
                    None
                }
            }
        };

        if let Some(old) = replaced {
            log::debug!("pid {} reused, replacing record", old.pid);
            self.notify(EventKind::Remove, old).await;
        }
        log::debug!("added process {} to table", process.pid);
        self.notify(EventKind::Add, process).await;
        Ok(())
    }

    /// Removes the record if present and notifies subscribers with the last
    /// known snapshot. Removing an absent PID is silent.
    pub async fn remove(&self, pid: i32) {
        let removed = self
            .data
            .lock()
            .expect("table data lock poisoned")
            .remove(&pid);

        if let Some(process) = removed {
            log::debug!("removed process {pid} from table");
            self.notify(EventKind::Remove, process).await;
        }
    }

    /// Returns an independently owned snapshot of the records matching
    /// `predicate`; later table mutations do not affect it.
    pub fn select<F>(&self, predicate: F) -> HashMap<i32, Process>
    where
        F: Fn(&Process) -> bool,
    {
        self.data
            .lock()
            .expect("table data lock poisoned")
            .iter()
            .filter(|(_, process)| predicate(process))
            .map(|(pid, process)| (*pid, process.clone()))
            .collect()
    }

    /// Registers a subscriber channel. Every table change from this point on
    /// is delivered to `sender` until [`Table::stop_listening`] detaches it.
    pub async fn listen(&self, sender: mpsc::Sender<TableEvent>) -> ListenerToken {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners.write().await.insert(id, sender);
        ListenerToken(id)
    }

    /// Detaches the subscriber; dropping the table's sender closes the
    /// subscriber's channel.
    pub async fn stop_listening(&self, token: ListenerToken) {
        if self.listeners.write().await.remove(&token.0).is_none() {
            log::warn!("could not stop listener, token {} not found", token.0);
        }
    }

    async fn notify(&self, kind: EventKind, process: Process) {
        let listeners = self.listeners.read().await;
        for sender in listeners.values() {
            let event = TableEvent {
                kind,
                process: process.clone(),
            };
            if sender.send(event).await.is_err() {
                log::warn!("table subscriber dropped its receiver without detaching");
            }
        }
    }
}
