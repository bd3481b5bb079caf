//! Terminal failure conditions of a single transfer session.
//!
//! Every variant maps to exactly one of two fates: it is reported to the
//! peer as a final ERROR datagram, or (for [`TransferError::PeerAborted`])
//! the session just stops. An inbound ERROR is never answered with another
//! ERROR.

use std::io;

use thiserror::Error;

use crate::protocol::{ErrorCode, Packet};

/// Why a transfer session ended without completing.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The requested download source does not exist.
    #[error("file not found")]
    NotFound,

    /// The path escapes its root, is not a regular file, or the write root
    /// cannot take new files. `detail` is the exact wire message.
    #[error("{detail}")]
    AccessDenied { detail: &'static str },

    /// The upload target already exists and overwriting is not allowed.
    #[error("file already exists")]
    AlreadyExists,

    /// The upload filename does not end in an allowed extension.
    #[error("file type not allowed")]
    InvalidExtension,

    /// The upload grew past the configured size ceiling.
    #[error("upload exceeds the size ceiling")]
    SizeLimitExceeded,

    /// The peer sent a packet that has no place in the current exchange.
    #[error("illegal TFTP operation")]
    IllegalOperation,

    /// The retry budget ran out while waiting for the peer.
    #[error("timeout waiting for {waiting_for}")]
    Timeout { waiting_for: &'static str },

    /// The peer ended the session with an ERROR packet of its own.
    #[error("peer aborted with error {code}: {message}")]
    PeerAborted { code: u16, message: String },

    /// Local filesystem or socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// The final ERROR datagram this failure is reported as, or `None` when
    /// the peer already ended the session and must not be answered.
    pub fn to_packet(&self) -> Option<Packet> {
        let (code, message) = match self {
            TransferError::NotFound => (ErrorCode::FileNotFound, None),
            TransferError::AccessDenied { detail } => {
                (ErrorCode::AccessViolation, Some((*detail).to_string()))
            }
            TransferError::AlreadyExists => (ErrorCode::FileAlreadyExists, None),
            TransferError::InvalidExtension => {
                (ErrorCode::NotDefined, Some("Invalid file type".to_string()))
            }
            TransferError::SizeLimitExceeded => {
                (ErrorCode::NotDefined, Some("File exceeds size limit".to_string()))
            }
            TransferError::IllegalOperation => (ErrorCode::IllegalOperation, None),
            TransferError::Timeout { waiting_for } => (
                ErrorCode::NotDefined,
                Some(format!("Timeout waiting for {waiting_for}")),
            ),
            // Local trouble is none of the peer's business beyond a generic
            // access violation.
            TransferError::Io(_) => (ErrorCode::AccessViolation, None),
            TransferError::PeerAborted { .. } => return None,
        };
        let message = message.unwrap_or_else(|| code.default_message().to_string());
        Some(Packet::error(code.as_u16(), message))
    }
}
