//! Process-connector watcher.
//!
//! Subscribes to the kernel's process connector, the netlink facility that
//! multicasts fork/exec/exit notifications for every process on the host.
//! Requires `CAP_NET_ADMIN` and the host network namespace; under Docker
//! that means `--cap-add=NET_ADMIN --net=host`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::netlink::{
    parse_netlink_messages, NetlinkClient, NetlinkMessage, NLMSG_DONE,
};

use super::{Error, EventKind, ProcessEvent, ProcessWatcher, Result, WatchSource};

const NETLINK_CONNECTOR: libc::c_int = 11;

/// Connector id of the process-events subsystem.
const CN_IDX_PROC: u32 = 1;
const CN_VAL_PROC: u32 = 1;

/// Multicast subscription ops carried in the `cn_msg` payload.
const PROC_CN_MCAST_LISTEN: u32 = 1;
const PROC_CN_MCAST_IGNORE: u32 = 2;

/// `proc_event.what` discriminants.
const PROC_EVENT_FORK: u32 = 0x0000_0001;
const PROC_EVENT_EXEC: u32 = 0x0000_0002;
const PROC_EVENT_EXIT: u32 = 0x8000_0000;

const CN_MSG_LEN: usize = 20;

/// How long a blocking receive may sleep before the loop re-checks its
/// shutdown channel.
const RECV_TIMEOUT: Duration = Duration::from_millis(250);

struct Running {
    // Dropping the sender closes the shutdown channel observed by the loop.
    stop_tx: std_mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// Watcher emitting process lifecycle events from the kernel process
/// connector.
///
/// The socket is owned exclusively by a dedicated thread; [`stop`] closes
/// the shutdown channel and joins it. The thread drops its event sender on
/// termination so the downstream channel closes.
///
/// [`stop`]: ProcessWatcher::stop
#[derive(Default)]
pub struct NetlinkProcessWatcher {
    running: Mutex<Option<Running>>,
    stopped: AtomicBool,
}

impl NetlinkProcessWatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessWatcher for NetlinkProcessWatcher {
    fn start(&self, events: mpsc::Sender<ProcessEvent>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let mut running = self.running.lock().expect("watcher state lock poisoned");
        if running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let client = NetlinkClient::new(NETLINK_CONNECTOR, CN_IDX_PROC)?;
        client.set_recv_timeout(RECV_TIMEOUT)?;
        client.send(mcast_message(PROC_CN_MCAST_LISTEN))?;

        let (stop_tx, stop_rx) = std_mpsc::channel();
        let handle = thread::spawn(move || watch_loop(client, events, stop_rx));
        *running = Some(Running { stop_tx, handle });

        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let running = self
            .running
            .lock()
            .expect("watcher state lock poisoned")
            .take();

        if let Some(Running { stop_tx, handle }) = running {
            drop(stop_tx);
            if handle.join().is_err() {
                log::error!("netlink process watcher thread panicked");
            }
            log::debug!("stopped netlink process watcher");
        }
    }
}

impl Drop for NetlinkProcessWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_loop(
    mut client: NetlinkClient,
    events: mpsc::Sender<ProcessEvent>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    'outer: loop {
        match stop_rx.try_recv() {
            Err(std_mpsc::TryRecvError::Empty) => {}
            // Closed sender or explicit signal both mean shutdown.
            _ => break,
        }

        let messages = match client.receive(false, parse_netlink_messages) {
            Ok(messages) => messages,
            // Receive-timeout wakeup so the shutdown channel gets observed.
            Err(crate::netlink::Error::WouldBlock) => continue,
            Err(crate::netlink::Error::Recv(err))
                if err.kind() == std::io::ErrorKind::Interrupted =>
            {
                continue
            }
            Err(crate::netlink::Error::InvalidMessage(reason)) => {
                log::warn!("dropping invalid connector datagram: {reason}");
                continue;
            }
            Err(err) => {
                log::error!("fatal netlink process watcher error: {err}");
                break;
            }
        };

        for message in messages {
            let Some(event) = normalize_event(&message) else {
                continue;
            };
            log::debug!(
                "received netlink {:?} event for pid {}",
                event.kind,
                event.pid
            );
            if events.blocking_send(event).is_err() {
                // Consumer went away; nothing left to emit to.
                break 'outer;
            }
        }
    }

    if let Err(err) = client.send(mcast_message(PROC_CN_MCAST_IGNORE)) {
        log::debug!("failed to unsubscribe from process connector: {err}");
    }
    client.close();
    // The events sender drops here, closing the channel for consumers.
}

/// Builds the `cn_msg` carrying a multicast subscription op.
fn mcast_message(op: u32) -> NetlinkMessage {
    let mut data = Vec::with_capacity(CN_MSG_LEN + 4);
    data.extend_from_slice(&CN_IDX_PROC.to_le_bytes());
    data.extend_from_slice(&CN_VAL_PROC.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes()); // seq
    data.extend_from_slice(&0u32.to_le_bytes()); // ack
    data.extend_from_slice(&4u16.to_le_bytes()); // payload length
    data.extend_from_slice(&0u16.to_le_bytes()); // flags
    data.extend_from_slice(&op.to_le_bytes());

    NetlinkMessage::new(NLMSG_DONE, 0, data)
}

/// Extracts and normalizes a process event from a connector message.
///
/// True forks (child pid == child tgid, i.e. a new process rather than a new
/// thread) and execs map to Add, exits map to Remove, every other subtype is
/// discarded.
fn normalize_event(message: &NetlinkMessage) -> Option<ProcessEvent> {
    if message.header.typ != NLMSG_DONE {
        return None;
    }

    let data = &message.data;
    // cn_msg header, then proc_event: what, cpu, timestamp_ns, event fields.
    if data.len() < CN_MSG_LEN + 16 {
        return None;
    }
    if read_u32(data, 0) != CN_IDX_PROC {
        return None;
    }

    let what = read_u32(data, CN_MSG_LEN);
    let fields = CN_MSG_LEN + 16;

    let event = |pid, kind| {
        Some(ProcessEvent {
            pid,
            kind,
            source: WatchSource::Netlink,
        })
    };

    match what {
        PROC_EVENT_FORK => {
            if data.len() < fields + 16 {
                return None;
            }
            let child_pid = read_u32(data, fields + 8) as i32;
            let child_tgid = read_u32(data, fields + 12) as i32;
            if child_pid != child_tgid {
                // New thread, not a new process.
                return None;
            }
            event(child_pid, EventKind::Add)
        }
        PROC_EVENT_EXEC => {
            if data.len() < fields + 8 {
                return None;
            }
            event(read_u32(data, fields) as i32, EventKind::Add)
        }
        PROC_EVENT_EXIT => {
            if data.len() < fields + 8 {
                return None;
            }
            event(read_u32(data, fields) as i32, EventKind::Remove)
        }
        _ => None,
    }
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::NetlinkHeader;

    fn connector_message(what: u32, fields: &[u32]) -> NetlinkMessage {
        let mut data = Vec::new();
        data.extend_from_slice(&CN_IDX_PROC.to_le_bytes());
        data.extend_from_slice(&CN_VAL_PROC.to_le_bytes());
        data.extend_from_slice(&[0u8; 12]); // seq, ack, len, flags
        data.extend_from_slice(&what.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // cpu
        data.extend_from_slice(&0u64.to_le_bytes()); // timestamp_ns
        for field in fields {
            data.extend_from_slice(&field.to_le_bytes());
        }

        NetlinkMessage {
            header: NetlinkHeader {
                typ: NLMSG_DONE,
                ..Default::default()
            },
            data,
        }
    }

    #[test]
    fn test_true_fork_is_add() {
        // parent_pid, parent_tgid, child_pid, child_tgid
        let message = connector_message(PROC_EVENT_FORK, &[100, 100, 222, 222]);
        let event = normalize_event(&message).unwrap();

        assert_eq!(event.pid, 222);
        assert_eq!(event.kind, EventKind::Add);
        assert_eq!(event.source, WatchSource::Netlink);
    }

    #[test]
    fn test_thread_fork_is_discarded() {
        let message = connector_message(PROC_EVENT_FORK, &[100, 100, 223, 100]);
        assert_eq!(normalize_event(&message), None);
    }

    #[test]
    fn test_exec_is_add() {
        let message = connector_message(PROC_EVENT_EXEC, &[555, 555]);
        let event = normalize_event(&message).unwrap();

        assert_eq!(event.pid, 555);
        assert_eq!(event.kind, EventKind::Add);
    }

    #[test]
    fn test_exit_is_remove() {
        let message = connector_message(PROC_EVENT_EXIT, &[555, 555, 0, 17]);
        let event = normalize_event(&message).unwrap();

        assert_eq!(event.pid, 555);
        assert_eq!(event.kind, EventKind::Remove);
    }

    #[test]
    fn test_other_subtypes_discarded() {
        // PROC_EVENT_COMM
        let message = connector_message(0x200, &[555, 555, 0, 0]);
        assert_eq!(normalize_event(&message), None);
    }

    #[test]
    fn test_start_after_stop_is_shutting_down() {
        let watcher = NetlinkProcessWatcher::new();
        watcher.stop();
        watcher.stop(); // idempotent

        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(watcher.start(tx), Err(Error::ShuttingDown)));
    }

    #[test]
    fn test_wrong_connector_idx_discarded() {
        let mut message = connector_message(PROC_EVENT_EXEC, &[555, 555]);
        message.data[0..4].copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(normalize_event(&message), None);
    }

    #[test]
    fn test_truncated_payload_discarded() {
        let mut message = connector_message(PROC_EVENT_FORK, &[100]);
        assert_eq!(normalize_event(&message), None);

        message.data.truncate(8);
        assert_eq!(normalize_event(&message), None);
    }
}
