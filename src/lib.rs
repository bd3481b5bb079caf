//! Lock-step TFTP file server.
//!
//! Implements the classic RFC 1350 exchange over UDP: read and write
//! requests answered in fixed 512-byte DATA blocks, one outstanding block at
//! a time, with per-block acknowledgments and timeout-driven retransmission.
//! A short final block ends a transfer; files sized at an exact multiple of
//! the block size end with an empty one.
//!
//! Downloads and uploads use separate root directories. Uploads additionally
//! pass an extension allow-list, must not overwrite existing files, and are
//! capped at a configurable size.
//!
//! - [`protocol`]: wire format, packet encode/decode
//! - [`error`]: terminal session failures and their wire reports
//! - [`validate`]: path confinement and request validation
//! - [`transfer`]: per-session workers on ephemeral sockets
//! - [`server`]: the request dispatcher

pub mod error;
pub mod protocol;
pub mod server;
pub mod transfer;
pub mod validate;

pub use error::TransferError;
pub use protocol::{DecodeError, ErrorCode, Opcode, Packet, RequestKind, BLOCK_SIZE, MAX_DATAGRAM};
pub use server::{ServerConfig, TftpServer};
pub use transfer::TransferConfig;
