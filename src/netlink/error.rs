use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create netlink socket: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to bind netlink socket: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to send netlink message: {0}")]
    Send(#[source] io::Error),
    #[error("failed to receive netlink message: {0}")]
    Recv(#[source] io::Error),
    #[error("receive would block")]
    WouldBlock,
    #[error("datagram of {datagram} bytes truncated to {buffer} byte read buffer")]
    Truncated { datagram: usize, buffer: usize },
    #[error("invalid netlink datagram: {0}")]
    InvalidMessage(&'static str),
    #[error("failed to parse netlink messages: {0}")]
    Parse(String),
    #[error("failed to write datagram to debug sink: {0}")]
    DebugSink(#[source] io::Error),
    #[error("netlink client is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error code carried in the payload of an `NLMSG_ERROR` message.
///
/// The numeric values and messages mirror libnl's closed error enumeration;
/// codes outside the known range degrade to [`NetlinkErrno::Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(u32)]
pub enum NetlinkErrno {
    #[error("Success")]
    Success = 0,
    #[error("Unspecific failure")]
    Failure,
    #[error("Interrupted system call")]
    Interrupted,
    #[error("Bad socket")]
    BadSocket,
    #[error("Try again")]
    TryAgain,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Object exists")]
    ObjectExists,
    #[error("Invalid input data or parameter")]
    InvalidInput,
    #[error("Input data out of range")]
    OutOfRange,
    #[error("Message size not sufficient")]
    MessageSize,
    #[error("Operation not supported")]
    OperationNotSupported,
    #[error("Address family not supported")]
    AddressFamilyNotSupported,
    #[error("Object not found")]
    ObjectNotFound,
    #[error("Attribute not available")]
    AttributeNotAvailable,
    #[error("Missing attribute")]
    MissingAttribute,
    #[error("Address family mismatch")]
    AddressFamilyMismatch,
    #[error("Message sequence number mismatch")]
    SequenceMismatch,
    #[error("Kernel reported message overflow")]
    MessageOverflow,
    #[error("Kernel reported truncated message")]
    MessageTruncated,
    #[error("Invalid address for specified address family")]
    NoAddress,
    #[error("Source based routing not supported")]
    SourceRoutingNotSupported,
    #[error("Netlink message is too short")]
    MessageTooShort,
    #[error("Netlink message type is not supported")]
    MessageTypeNotSupported,
    #[error("Object type does not match cache")]
    ObjectMismatch,
    #[error("Unknown or invalid cache type")]
    InvalidCache,
    #[error("Object busy")]
    Busy,
    #[error("Protocol mismatch")]
    ProtocolMismatch,
    #[error("No Access")]
    NoAccess,
    #[error("Operation not permitted")]
    NotPermitted,
    #[error("Unable to open packet location file")]
    PacketLocationFile,
    #[error("Unable to parse object")]
    ParseFailure,
    #[error("No such device")]
    NoDevice,
    #[error("Immutable attribute")]
    Immutable,
    #[error("Dump inconsistency detected, interrupted")]
    DumpInterrupted,
    #[error("Attribute max length exceeded")]
    AttributeSize,
}

impl NetlinkErrno {
    /// Maps a numeric code to its variant, degrading unknown codes to
    /// [`NetlinkErrno::Failure`].
    pub fn from_code(code: u32) -> Self {
        use NetlinkErrno::*;
        match code {
            0 => Success,
            1 => Failure,
            2 => Interrupted,
            3 => BadSocket,
            4 => TryAgain,
            5 => OutOfMemory,
            6 => ObjectExists,
            7 => InvalidInput,
            8 => OutOfRange,
            9 => MessageSize,
            10 => OperationNotSupported,
            11 => AddressFamilyNotSupported,
            12 => ObjectNotFound,
            13 => AttributeNotAvailable,
            14 => MissingAttribute,
            15 => AddressFamilyMismatch,
            16 => SequenceMismatch,
            17 => MessageOverflow,
            18 => MessageTruncated,
            19 => NoAddress,
            20 => SourceRoutingNotSupported,
            21 => MessageTooShort,
            22 => MessageTypeNotSupported,
            23 => ObjectMismatch,
            24 => InvalidCache,
            25 => Busy,
            26 => ProtocolMismatch,
            27 => NoAccess,
            28 => NotPermitted,
            29 => PacketLocationFile,
            30 => ParseFailure,
            31 => NoDevice,
            32 => Immutable,
            33 => DumpInterrupted,
            34 => AttributeSize,
            _ => Failure,
        }
    }
}

/// Parses the errno from the data section of an `NLMSG_ERROR` message.
///
/// The payload carries a little-endian signed errno in its first four bytes;
/// the negated value indexes the libnl error enumeration and `0` is
/// acknowledged success.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the payload is shorter than four bytes.
pub fn parse_netlink_error(data: &[u8]) -> Result<NetlinkErrno> {
    if data.len() < 4 {
        return Err(Error::Parse(
            "received netlink error (data too short to read errno)".to_owned(),
        ));
    }

    let errno = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    Ok(NetlinkErrno::from_code(errno.wrapping_neg() as u32))
}
