//! Process records and the live process table.
//!
//! A [`Process`] is a snapshot of the kernel's view of one process, keyed by
//! PID for lookup but identified by the `(pid, starttime)` pair: PIDs are
//! reused by the kernel, the start-time token is not. The [`Table`] keeps
//! the authoritative set of live processes by merging a full procfs
//! enumeration with the lifecycle-event stream from a [`watcher`].

use crate::procfs::{self, Namespaces, Proc};

mod table;
pub mod watcher;

pub use table::{Error, ListenerToken, Table, TableEvent};

/// Snapshot of a single live process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub pid: i32,
    pub ppid: i32,
    pub pgrp: i32,
    /// Short command name from the stat file.
    pub command: String,
    /// Full command line, arguments joined by single spaces.
    pub cmdline: String,
    pub namespaces: Namespaces,
    starttime: u64,
}

impl Process {
    /// Builds a record by reading the process's attributes from procfs.
    ///
    /// # Errors
    ///
    /// Returns [`procfs::Error::NotFound`] when the process exits mid-read;
    /// callers racing the kernel skip the record on this error.
    pub fn new(proc: &Proc) -> procfs::Result<Self> {
        let stat = proc.stat()?;
        let cmdline = proc.cmdline()?;
        let namespaces = proc.namespaces()?;

        Ok(Self {
            pid: proc.pid(),
            ppid: stat.ppid,
            pgrp: stat.pgrp,
            command: stat.comm,
            cmdline,
            namespaces,
            starttime: stat.starttime,
        })
    }

    /// The boot-relative start-time token disambiguating PID reuse.
    pub fn starttime(&self) -> u64 {
        self.starttime
    }

    /// Two records describe the same process only when both the PID and the
    /// start-time token match.
    pub fn is_same_process(&self, other: &Process) -> bool {
        self.pid == other.pid && self.starttime == other.starttime
    }

    /// True iff both this process and `self_namespaces` report a `net`
    /// namespace and the two identifiers differ.
    pub fn has_unique_network_namespace(&self, self_namespaces: &Namespaces) -> bool {
        match (self.namespaces.get("net"), self_namespaces.get("net")) {
            (Some(own), Some(host)) => own != host,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(pid: i32, starttime: u64) -> Process {
        Process {
            pid,
            ppid: 1,
            pgrp: pid,
            command: "test".to_owned(),
            cmdline: "test --flag".to_owned(),
            namespaces: Namespaces::new(),
            starttime,
        }
    }

    #[test]
    fn test_identity_requires_starttime() {
        let a = process(100, 5000);
        let b = process(100, 5000);
        let reused = process(100, 9000);

        assert!(a.is_same_process(&b));
        assert!(!a.is_same_process(&reused));
    }

    #[test]
    fn test_unique_network_namespace() {
        let mut host = Namespaces::new();
        host.insert("net".to_owned(), 4026531993);

        let mut p = process(100, 5000);
        assert!(!p.has_unique_network_namespace(&host));

        p.namespaces.insert("net".to_owned(), 4026531993);
        assert!(!p.has_unique_network_namespace(&host));

        p.namespaces.insert("net".to_owned(), 4026532701);
        assert!(p.has_unique_network_namespace(&host));

        assert!(!p.has_unique_network_namespace(&Namespaces::new()));
    }
}
