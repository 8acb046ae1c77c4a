//! Shared surface of the audit netlink subsystem.
//!
//! The audit client proper lives elsewhere; this module carries the pieces it
//! shares with the netlink transport: the audit text-header format, the
//! non-standard datagram framing (one message per datagram, header length
//! ignored), and the `audit_status` wire structure used to configure the
//! kernel's audit dispatcher.

use chrono::{DateTime, TimeZone, Utc};

use crate::netlink::{
    self, parse_netlink_error, NetlinkClient, NetlinkErrno, NetlinkHeader, NetlinkMessage,
    NLMSG_ERROR, NLMSG_HDRLEN, NLM_F_ACK, NLM_F_REQUEST,
};

/// Audit netlink message types.
pub const AUDIT_GET: u16 = 1000;
pub const AUDIT_SET: u16 = 1001;
pub const AUDIT_GET_FEATURE: u16 = 1019;

/// `audit_status` mask flags selecting which fields the kernel should apply.
pub const AUDIT_STATUS_ENABLED: u32 = 0x0001;
pub const AUDIT_STATUS_FAILURE: u32 = 0x0002;
pub const AUDIT_STATUS_PID: u32 = 0x0004;
pub const AUDIT_STATUS_RATE_LIMIT: u32 = 0x0008;
pub const AUDIT_STATUS_BACKLOG_LIMIT: u32 = 0x0010;
pub const AUDIT_STATUS_BACKLOG_WAIT_TIME: u32 = 0x0020;

const AUDIT_STATUS_WIRE_LEN: usize = 40;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid audit message header")]
    InvalidHeader,
    #[error("audit status payload must be {AUDIT_STATUS_WIRE_LEN} bytes, got {0}")]
    InvalidStatusLength(usize),
    #[error(transparent)]
    Netlink(#[from] netlink::Error),
    #[error("kernel rejected audit request: {0}")]
    Rejected(NetlinkErrno),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The parsed `audit(<seconds>.<milliseconds>:<sequence>):` prefix of an
/// audit payload. Renders back to the identical text via [`std::fmt::Display`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditHeader {
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

impl AuditHeader {
    /// Parses the header from the start of an audit payload. The remainder of
    /// the payload (free-form key=value pairs) is left to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHeader`] when the delimiting tokens are absent
    /// or the numeric fields do not parse.
    pub fn parse(line: &[u8]) -> Result<Self> {
        let start = find(line, b'(').ok_or(Error::InvalidHeader)?;
        let dot = find(&line[start..], b'.').ok_or(Error::InvalidHeader)? + start;
        let sep = find(&line[dot..], b':').ok_or(Error::InvalidHeader)? + dot;
        let end = find(&line[sep..], b')').ok_or(Error::InvalidHeader)? + sep;

        let sec = parse_u64(&line[start + 1..dot])? as i64;
        let msec = parse_u64(&line[dot + 1..sep])?;
        let sequence = parse_u64(&line[sep + 1..end])?;

        let timestamp = Utc
            .timestamp_opt(sec, (msec * 1_000_000) as u32)
            .single()
            .ok_or(Error::InvalidHeader)?;

        Ok(Self {
            timestamp,
            sequence,
        })
    }
}

impl std::fmt::Display for AuditHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "audit({}.{:03}:{}):",
            self.timestamp.timestamp(),
            self.timestamp.timestamp_subsec_millis(),
            self.sequence
        )
    }
}

fn find(buf: &[u8], byte: u8) -> Option<usize> {
    buf.iter().position(|&b| b == byte)
}

fn parse_u64(buf: &[u8]) -> Result<u64> {
    std::str::from_utf8(buf)
        .map_err(|_| Error::InvalidHeader)?
        .parse()
        .map_err(|_| Error::InvalidHeader)
}

/// An audit record received from the kernel: the netlink record type, the
/// parsed header, and the raw payload text.
#[derive(Debug, Clone)]
pub struct AuditMessage {
    pub record_type: u16,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
    pub raw_data: String,
}

impl AuditMessage {
    /// # Errors
    ///
    /// Returns [`Error::InvalidHeader`] when the payload does not start with
    /// an audit header.
    pub fn from_netlink(message: &NetlinkMessage) -> Result<Self> {
        let header = AuditHeader::parse(&message.data)?;

        Ok(Self {
            record_type: message.header.typ,
            timestamp: header.timestamp,
            sequence: header.sequence,
            raw_data: String::from_utf8_lossy(&message.data).into_owned(),
        })
    }
}

/// Parses an audit datagram.
///
/// Audit datagrams differ from standard netlink framing: the kernel sends
/// exactly one message per datagram and the header length field must be
/// ignored, so the payload is everything past the 16-byte header. This is the
/// parser variant handed to [`NetlinkClient::receive`] by audit consumers.
///
/// # Errors
///
/// Returns [`netlink::Error::InvalidMessage`] when the buffer is shorter than
/// the netlink header.
pub fn parse_netlink_audit_message(buf: &[u8]) -> netlink::Result<Vec<NetlinkMessage>> {
    let header = NetlinkHeader::from_bytes(buf)?;

    Ok(vec![NetlinkMessage {
        header,
        data: buf[NLMSG_HDRLEN..].to_vec(),
    }])
}

/// The kernel's `audit_status` structure: ten little-endian `u32` fields,
/// 40 bytes on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditStatus {
    /// Bit mask selecting valid entries.
    pub mask: u32,
    /// 1 = enabled, 0 = disabled.
    pub enabled: u32,
    /// Failure-to-log action.
    pub failure: u32,
    /// PID of the audit dispatcher.
    pub pid: u32,
    /// Message rate limit (per second).
    pub rate_limit: u32,
    /// Waiting message limit.
    pub backlog_limit: u32,
    /// Messages lost.
    pub lost: u32,
    /// Messages waiting in queue.
    pub backlog: u32,
    /// Bitmap of kernel audit features.
    pub feature_bitmap: u32,
    /// Message queue wait timeout.
    pub backlog_wait_time: u32,
}

impl AuditStatus {
    fn fields(&self) -> [u32; 10] {
        [
            self.mask,
            self.enabled,
            self.failure,
            self.pid,
            self.rate_limit,
            self.backlog_limit,
            self.lost,
            self.backlog,
            self.feature_bitmap,
            self.backlog_wait_time,
        ]
    }

    pub fn to_wire_format(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(AUDIT_STATUS_WIRE_LEN);
        for field in self.fields() {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidStatusLength`] when the payload is not exactly
    /// 40 bytes.
    pub fn from_wire_format(buf: &[u8]) -> Result<Self> {
        if buf.len() != AUDIT_STATUS_WIRE_LEN {
            return Err(Error::InvalidStatusLength(buf.len()));
        }

        let mut fields = [0u32; 10];
        for (i, field) in fields.iter_mut().enumerate() {
            let offset = i * 4;
            *field = u32::from_le_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]);
        }

        Ok(Self {
            mask: fields[0],
            enabled: fields[1],
            failure: fields[2],
            pid: fields[3],
            rate_limit: fields[4],
            backlog_limit: fields[5],
            lost: fields[6],
            backlog: fields[7],
            feature_bitmap: fields[8],
            backlog_wait_time: fields[9],
        })
    }
}

/// Tells the kernel which PID should receive audit messages.
///
/// Sends an `AUDIT_SET` request and waits for the acknowledgement matching
/// the assigned sequence number; other messages encountered while waiting are
/// discarded.
///
/// # Errors
///
/// Returns [`Error::Rejected`] when the kernel acknowledges with a nonzero
/// errno, or the underlying transport error.
pub fn audit_set_pid(client: &mut NetlinkClient, pid: u32) -> Result<()> {
    let status = AuditStatus {
        mask: AUDIT_STATUS_PID,
        pid,
        ..Default::default()
    };

    let message = NetlinkMessage::new(
        AUDIT_SET,
        NLM_F_REQUEST | NLM_F_ACK,
        status.to_wire_format(),
    );
    let seq = client.send(message)?;

    loop {
        let messages = client.receive(false, parse_netlink_audit_message)?;
        for message in messages {
            if message.header.seq != seq {
                log::debug!(
                    "discarding audit message with sequence {} while waiting for {}",
                    message.header.seq,
                    seq
                );
                continue;
            }
            if message.header.typ == NLMSG_ERROR {
                return match parse_netlink_error(&message.data)? {
                    NetlinkErrno::Success => Ok(()),
                    errno => Err(Error::Rejected(errno)),
                };
            }
        }
    }
}
