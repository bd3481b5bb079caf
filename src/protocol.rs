//! TFTP wire format.
//!
//! Every datagram starts with a two-byte big-endian opcode. Requests carry a
//! filename and a transfer mode as NUL-terminated strings, DATA packets carry
//! a block number and up to 512 payload bytes, ACK packets carry the block
//! number they acknowledge, and ERROR packets carry a numeric code plus a
//! NUL-terminated human-readable message.
//!
//! Decoding is strict about structure (length prefixes, terminators, the
//! payload ceiling) and deliberately lax about anything after the mode
//! terminator, so requests from clients that append option lists still parse.

use thiserror::Error;

/// Fixed payload size of a full DATA block.
pub const BLOCK_SIZE: usize = 512;

/// Largest datagram the protocol produces: opcode + block number + full block.
pub const MAX_DATAGRAM: usize = 4 + BLOCK_SIZE;

/// TFTP opcodes as defined by RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Read request (RRQ)
    Rrq = 1,
    /// Write request (WRQ)
    Wrq = 2,
    /// Data packet
    Data = 3,
    /// Acknowledgment
    Ack = 4,
    /// Error packet
    Error = 5,
}

impl Opcode {
    /// Convert a wire opcode into the enum, if it is one we know.
    ///
    /// # Examples
    ///
    /// ```
    /// use tftpd::Opcode;
    ///
    /// assert_eq!(Opcode::from_u16(1), Some(Opcode::Rrq));
    /// assert_eq!(Opcode::from_u16(9), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            _ => None,
        }
    }

    /// Wire value of the opcode.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Short name used in log messages.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Rrq => "RRQ",
            Opcode::Wrq => "WRQ",
            Opcode::Data => "DATA",
            Opcode::Ack => "ACK",
            Opcode::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP error codes carried in ERROR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Not defined, see error message
    NotDefined = 0,
    /// File not found
    FileNotFound = 1,
    /// Access violation
    AccessViolation = 2,
    /// Disk full or allocation exceeded
    DiskFull = 3,
    /// Illegal TFTP operation
    IllegalOperation = 4,
    /// Unknown transfer ID
    UnknownTransferId = 5,
    /// File already exists
    FileAlreadyExists = 6,
    /// No such user
    NoSuchUser = 7,
}

impl ErrorCode {
    /// Convert a wire error code into the enum, if defined.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(ErrorCode::NotDefined),
            1 => Some(ErrorCode::FileNotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::IllegalOperation),
            5 => Some(ErrorCode::UnknownTransferId),
            6 => Some(ErrorCode::FileAlreadyExists),
            7 => Some(ErrorCode::NoSuchUser),
            _ => None,
        }
    }

    /// Wire value of the error code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Canonical message for the code, used when nothing more specific fits.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.default_message())
    }
}

/// Direction requested by the first datagram of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// RRQ: the peer wants to download a file from us.
    Read,
    /// WRQ: the peer wants to upload a file to us.
    Write,
}

impl RequestKind {
    /// Short name used in log messages.
    pub fn name(self) -> &'static str {
        match self {
            RequestKind::Read => "RRQ",
            RequestKind::Write => "WRQ",
        }
    }
}

/// Why a datagram failed to decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Datagram ended before the mandatory fields of its opcode.
    #[error("datagram too short ({0} bytes)")]
    Truncated(usize),
    /// The first two bytes are not a known opcode.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    /// A request string field is missing its NUL terminator or is not UTF-8.
    #[error("malformed request: {0}")]
    MalformedRequest(&'static str),
    /// The request names a transfer mode other than octet.
    #[error("unsupported transfer mode \"{0}\"")]
    UnsupportedMode(String),
    /// A DATA packet carries more than one block of payload.
    #[error("DATA payload of {0} bytes exceeds the 512-byte block size")]
    PayloadTooLarge(usize),
}

/// A decoded TFTP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// RRQ or WRQ: filename and transfer mode as sent by the peer.
    Request {
        kind: RequestKind,
        filename: String,
        mode: String,
    },
    /// One block of file content. A payload shorter than [`BLOCK_SIZE`]
    /// marks the end of the transfer.
    Data { block: u16, payload: Vec<u8> },
    /// Acknowledgment of the DATA packet with the same block number.
    /// Block 0 acknowledges a write request itself.
    Ack { block: u16 },
    /// Terminal error report. Receiving one ends the session immediately.
    Error { code: u16, message: String },
}

impl Packet {
    /// DATA packet for one block.
    pub fn data(block: u16, payload: Vec<u8>) -> Self {
        Packet::Data { block, payload }
    }

    /// ACK packet for one block number.
    pub fn ack(block: u16) -> Self {
        Packet::Ack { block }
    }

    /// ERROR packet with an explicit code and message.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Packet::Error {
            code,
            message: message.into(),
        }
    }

    /// Opcode of this packet.
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Request {
                kind: RequestKind::Read,
                ..
            } => Opcode::Rrq,
            Packet::Request {
                kind: RequestKind::Write,
                ..
            } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
        }
    }

    /// Decode one datagram.
    ///
    /// # Examples
    ///
    /// ```
    /// use tftpd::{Packet, RequestKind};
    ///
    /// let buf = b"\x00\x01boot.txt\x00octet\x00";
    /// let packet = Packet::decode(buf).unwrap();
    /// assert_eq!(
    ///     packet,
    ///     Packet::Request {
    ///         kind: RequestKind::Read,
    ///         filename: "boot.txt".to_string(),
    ///         mode: "octet".to_string(),
    ///     }
    /// );
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < 2 {
            return Err(DecodeError::Truncated(buf.len()));
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        match Opcode::from_u16(opcode) {
            Some(Opcode::Rrq) => decode_request(RequestKind::Read, buf),
            Some(Opcode::Wrq) => decode_request(RequestKind::Write, buf),
            Some(Opcode::Data) => {
                if buf.len() < 4 {
                    return Err(DecodeError::Truncated(buf.len()));
                }
                let payload = buf[4..].to_vec();
                if payload.len() > BLOCK_SIZE {
                    return Err(DecodeError::PayloadTooLarge(payload.len()));
                }
                Ok(Packet::Data {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                    payload,
                })
            }
            Some(Opcode::Ack) => {
                if buf.len() < 4 {
                    return Err(DecodeError::Truncated(buf.len()));
                }
                Ok(Packet::Ack {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                })
            }
            Some(Opcode::Error) => {
                if buf.len() < 4 {
                    return Err(DecodeError::Truncated(buf.len()));
                }
                let tail = &buf[4..];
                let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
                // The message is display-only, so a peer that sends invalid
                // UTF-8 still gets its error honored.
                Ok(Packet::Error {
                    code: u16::from_be_bytes([buf[2], buf[3]]),
                    message: String::from_utf8_lossy(&tail[..end]).into_owned(),
                })
            }
            None => Err(DecodeError::UnknownOpcode(opcode)),
        }
    }

    /// Encode the packet into a fresh datagram buffer.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Request {
                kind,
                filename,
                mode,
            } => {
                let opcode = match kind {
                    RequestKind::Read => Opcode::Rrq,
                    RequestKind::Write => Opcode::Wrq,
                };
                let mut buf = Vec::with_capacity(4 + filename.len() + mode.len());
                buf.extend_from_slice(&opcode.as_u16().to_be_bytes());
                buf.extend_from_slice(filename.as_bytes());
                buf.push(0);
                buf.extend_from_slice(mode.as_bytes());
                buf.push(0);
                buf
            }
            Packet::Data { block, payload } => {
                let mut buf = Vec::with_capacity(4 + payload.len());
                buf.extend_from_slice(&Opcode::Data.as_u16().to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(payload);
                buf
            }
            Packet::Ack { block } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&Opcode::Ack.as_u16().to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf
            }
            Packet::Error { code, message } => {
                let mut buf = Vec::with_capacity(5 + message.len());
                buf.extend_from_slice(&Opcode::Error.as_u16().to_be_bytes());
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
                buf
            }
        }
    }
}

/// Find the index of the next NUL byte at or after `start`.
fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    if start >= buf.len() {
        return None;
    }
    buf[start..].iter().position(|&b| b == 0).map(|pos| start + pos)
}

fn decode_request(kind: RequestKind, buf: &[u8]) -> Result<Packet, DecodeError> {
    let filename_end = find_zero(buf, 2)
        .ok_or(DecodeError::MalformedRequest("filename is not NUL-terminated"))?;
    let filename = std::str::from_utf8(&buf[2..filename_end])
        .map_err(|_| DecodeError::MalformedRequest("filename is not valid UTF-8"))?;

    let mode_start = filename_end + 1;
    let mode_end = find_zero(buf, mode_start)
        .ok_or(DecodeError::MalformedRequest("mode is not NUL-terminated"))?;
    let mode = std::str::from_utf8(&buf[mode_start..mode_end])
        .map_err(|_| DecodeError::MalformedRequest("mode is not valid UTF-8"))?;

    // Only binary transfers are supported. netascii would require line
    // ending translation and mail mode is long dead.
    if !mode.eq_ignore_ascii_case("octet") {
        return Err(DecodeError::UnsupportedMode(mode.to_string()));
    }

    // Anything after the mode terminator (such as RFC 2347 option lists) is
    // ignored rather than rejected.
    Ok(Packet::Request {
        kind,
        filename: filename.to_string(),
        mode: mode.to_string(),
    })
}
