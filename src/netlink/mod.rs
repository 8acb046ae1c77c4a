//! Generic netlink client used by the process-event watcher and the audit
//! subsystem.
//!
//! The client owns a raw `AF_NETLINK` socket and provides framed send and
//! receive operations on top of it. Outgoing messages are stamped with a
//! per-client monotonically increasing sequence number; incoming datagrams
//! are validated (header length, source address) and handed to a
//! caller-supplied parser, so protocols with non-standard framing (such as
//! audit, which ignores the header length field) can plug in their own.
//!
//! # Platform Requirements
//!
//! - Linux. Netlink sockets require the host network namespace, and the
//!   process connector additionally requires `CAP_NET_ADMIN`.

use std::io::{self, Write};
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};

mod error;

pub use error::{parse_netlink_error, Error, NetlinkErrno, Result};

/// Length of the fixed netlink message header.
pub const NLMSG_HDRLEN: usize = 16;

const NLMSG_ALIGNTO: usize = 4;

/// Standard netlink message types.
pub const NLMSG_NOOP: u16 = 0x1;
pub const NLMSG_ERROR: u16 = 0x2;
pub const NLMSG_DONE: u16 = 0x3;
pub const NLMSG_OVERRUN: u16 = 0x4;

/// Standard netlink message flags.
pub const NLM_F_REQUEST: u16 = 0x1;
pub const NLM_F_ACK: u16 = 0x4;

#[inline]
fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// The fixed 16-byte netlink message header, little-endian on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetlinkHeader {
    pub len: u32,
    pub typ: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NetlinkHeader {
    /// Decodes the little-endian header from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] when `buf` is shorter than
    /// [`NLMSG_HDRLEN`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < NLMSG_HDRLEN {
            return Err(Error::InvalidMessage("datagram shorter than netlink header"));
        }

        Ok(Self {
            len: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            typ: u16::from_le_bytes([buf[4], buf[5]]),
            flags: u16::from_le_bytes([buf[6], buf[7]]),
            seq: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            pid: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.len.to_le_bytes());
        out.extend_from_slice(&self.typ.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
    }
}

/// A netlink message: header plus owned payload bytes.
#[derive(Debug, Clone, Default)]
pub struct NetlinkMessage {
    pub header: NetlinkHeader,
    pub data: Vec<u8>,
}

impl NetlinkMessage {
    /// Creates a message with the given type, flags, and payload. The length
    /// and sequence fields are filled in when the message is sent.
    pub fn new(typ: u16, flags: u16, data: Vec<u8>) -> Self {
        Self {
            header: NetlinkHeader {
                typ,
                flags,
                ..Default::default()
            },
            data,
        }
    }

    /// Serializes the message, computing the header length field and padding
    /// the payload to the 4-byte netlink alignment.
    pub fn to_wire_format(&self) -> Vec<u8> {
        let len = NLMSG_HDRLEN + self.data.len();
        let mut out = Vec::with_capacity(nlmsg_align(len));
        let mut header = self.header;
        header.len = len as u32;
        header.write_to(&mut out);
        out.extend_from_slice(&self.data);
        out.resize(nlmsg_align(len), 0);
        out
    }
}

/// Parses a datagram containing one or more standard netlink frames.
///
/// Frames are delimited by the header length field, rounded up to the 4-byte
/// alignment between frames.
///
/// # Errors
///
/// Returns [`Error::Parse`] when a frame's length field is shorter than the
/// header or runs past the end of the datagram.
pub fn parse_netlink_messages(buf: &[u8]) -> Result<Vec<NetlinkMessage>> {
    let mut messages = Vec::new();
    let mut rest = buf;

    while rest.len() >= NLMSG_HDRLEN {
        let header = NetlinkHeader::from_bytes(rest)?;
        let len = header.len as usize;
        if len < NLMSG_HDRLEN {
            return Err(Error::Parse(format!(
                "netlink message length {len} shorter than header"
            )));
        }
        if len > rest.len() {
            return Err(Error::Parse(format!(
                "netlink message length {len} exceeds remaining {} bytes",
                rest.len()
            )));
        }

        messages.push(NetlinkMessage {
            header,
            data: rest[NLMSG_HDRLEN..len].to_vec(),
        });

        let advance = nlmsg_align(len).min(rest.len());
        rest = &rest[advance..];
    }

    Ok(messages)
}

/// A raw netlink socket client.
///
/// The client owns the socket exclusively; once handed to a watcher task no
/// other task touches the file descriptor. Dropping the client closes the
/// socket.
pub struct NetlinkClient {
    fd: libc::c_int,
    seq: AtomicU32,
    read_buf: Vec<u8>,
    debug_sink: Option<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for NetlinkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetlinkClient")
            .field("fd", &self.fd)
            .field("read_buf_len", &self.read_buf.len())
            .finish()
    }
}

impl NetlinkClient {
    /// Opens a raw netlink socket for the given protocol and binds it.
    ///
    /// `groups` is the multicast group mask passed to bind; unicast-only
    /// clients pass `0`. The read buffer defaults to the system page size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socket`] or [`Error::Bind`] carrying the OS error.
    /// A `PermissionDenied` source indicates missing capabilities
    /// (`CAP_NET_ADMIN` for the process connector).
    pub fn new(protocol: libc::c_int, groups: u32) -> Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, protocol) };
        if fd < 0 {
            return Err(Error::Socket(io::Error::last_os_error()));
        }

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = groups;

        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Bind(err));
        }

        let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        };

        Ok(Self {
            fd,
            seq: AtomicU32::new(0),
            read_buf: vec![0u8; page_size],
            debug_sink: None,
        })
    }

    /// Tees every received raw datagram into `sink` for inspection.
    pub fn with_debug_sink(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.debug_sink = Some(sink);
        self
    }

    /// Sets a receive timeout on the socket so blocking reads wake up
    /// periodically. Used by watcher loops to observe their shutdown channel.
    pub fn set_recv_timeout(&self, timeout: std::time::Duration) -> Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::Socket(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Serializes `message`, stamps a fresh sequence number into its header,
    /// and writes it to the socket. Returns the assigned sequence number so
    /// the caller can match the reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Send`] on write failure, [`Error::Closed`] after
    /// [`NetlinkClient::close`].
    pub fn send(&self, mut message: NetlinkMessage) -> Result<u32> {
        if self.fd < 0 {
            return Err(Error::Closed);
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        message.header.seq = seq;
        let buf = message.to_wire_format();

        let mut dest: libc::sockaddr_nl = unsafe { mem::zeroed() };
        dest.nl_family = libc::AF_NETLINK as libc::sa_family_t;

        let rc = unsafe {
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &dest as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::Send(io::Error::last_os_error()));
        }

        Ok(seq)
    }

    /// Reads one datagram into the reusable buffer and parses it with the
    /// caller-supplied parser.
    ///
    /// Datagrams whose source address carries a nonzero port id are rejected:
    /// only the kernel (port id 0) may talk to this socket.
    ///
    /// # Errors
    ///
    /// - [`Error::WouldBlock`] in non-blocking mode with no data pending.
    /// - [`Error::Truncated`] when the datagram exceeds the read buffer.
    /// - [`Error::InvalidMessage`] for short or spoofed datagrams.
    /// - Whatever the parser returns for malformed frames.
    pub fn receive<P>(&mut self, non_blocking: bool, parser: P) -> Result<Vec<NetlinkMessage>>
    where
        P: FnOnce(&[u8]) -> Result<Vec<NetlinkMessage>>,
    {
        if self.fd < 0 {
            return Err(Error::Closed);
        }

        let mut flags = libc::MSG_TRUNC;
        if non_blocking {
            flags |= libc::MSG_DONTWAIT;
        }

        let mut from: libc::sockaddr_nl = unsafe { mem::zeroed() };
        let mut from_len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;

        let n = unsafe {
            libc::recvfrom(
                self.fd,
                self.read_buf.as_mut_ptr() as *mut libc::c_void,
                self.read_buf.len(),
                flags,
                &mut from as *mut libc::sockaddr_nl as *mut libc::sockaddr,
                &mut from_len,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(Error::WouldBlock);
            }
            return Err(Error::Recv(err));
        }

        let n = n as usize;
        if n > self.read_buf.len() {
            // MSG_TRUNC reports the real datagram size.
            return Err(Error::Truncated {
                datagram: n,
                buffer: self.read_buf.len(),
            });
        }
        if n < NLMSG_HDRLEN {
            return Err(Error::InvalidMessage("datagram shorter than netlink header"));
        }
        if from.nl_pid != 0 {
            // Spoofed packet from another userspace process.
            return Err(Error::InvalidMessage("nonzero source port id"));
        }

        let buf = &self.read_buf[..n];
        if let Some(sink) = self.debug_sink.as_mut() {
            sink.write_all(buf).map_err(Error::DebugSink)?;
        }

        parser(buf)
    }

    /// Releases the socket. Idempotent; subsequent operations fail with
    /// [`Error::Closed`].
    pub fn close(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

impl Drop for NetlinkClient {
    fn drop(&mut self) {
        self.close();
    }
}
