//! Per-session transfer workers.
//!
//! Each accepted request gets its own ephemeral UDP socket connected to the
//! peer. Both directions are built on one lock-step primitive, [`exchange`]:
//! optionally (re)send a datagram, then wait for the packet the current step
//! needs, retrying until the attempt budget runs out.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::TransferError;
use crate::protocol::{DecodeError, Packet, BLOCK_SIZE};
use crate::validate;

const DEFAULT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_MAX_RETRIES: usize = 5;
const DEFAULT_MAX_UPLOAD_SIZE: u64 = 10 * 1024 * 1024;

/// Settings shared by every transfer session. Fixed once the server starts.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Directory downloads are served from.
    pub read_root: PathBuf,
    /// Directory uploads are stored in.
    pub write_root: PathBuf,
    /// How long one attempt waits for the peer before retrying.
    pub timeout: Duration,
    /// Send attempts per block before the session is abandoned.
    pub max_retries: usize,
    /// Uploads larger than this are aborted mid-transfer.
    pub max_upload_size: u64,
    /// Filename suffixes accepted for uploads.
    pub allowed_extensions: Vec<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            read_root: PathBuf::from("./tftp_read"),
            write_root: PathBuf::from("./tftp_write"),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            allowed_extensions: validate::DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Verdict a classifier passes back for one inbound packet.
enum Step<T> {
    /// The awaited packet arrived; the exchange is over.
    Accept(T),
    /// Not what this step is waiting for. Spends one attempt.
    Retry,
    /// Terminal protocol violation.
    Abort(TransferError),
}

/// Run one lock-step exchange against the connected peer.
///
/// When `resend` is set, the datagram is sent at the start of every attempt,
/// so retries retransmit the identical bytes. A decoded ERROR from the peer
/// always ends the exchange as [`TransferError::PeerAborted`] before the
/// classifier sees it, and is never answered. Exhausting `max_attempts`
/// yields [`TransferError::Timeout`] tagged with `waiting_for`.
async fn exchange<T, F>(
    socket: &UdpSocket,
    resend: Option<&[u8]>,
    wait: Duration,
    max_attempts: usize,
    waiting_for: &'static str,
    mut classify: F,
) -> Result<T, TransferError>
where
    F: FnMut(Result<Packet, DecodeError>) -> Step<T>,
{
    let mut buf = [0u8; 1024];
    for _ in 0..max_attempts {
        if let Some(datagram) = resend {
            socket.send(datagram).await?;
        }
        let len = match timeout(wait, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => len,
            Ok(Err(e)) => return Err(e.into()),
            // Nothing arrived in time. Spend the attempt.
            Err(_) => continue,
        };
        match Packet::decode(&buf[..len]) {
            Ok(Packet::Error { code, message }) => {
                return Err(TransferError::PeerAborted { code, message });
            }
            decoded => match classify(decoded) {
                Step::Accept(value) => return Ok(value),
                Step::Retry => {}
                Step::Abort(err) => return Err(err),
            },
        }
    }
    Err(TransferError::Timeout { waiting_for })
}

/// Ephemeral socket of the peer's address family, connected so the kernel
/// filters out datagrams from unrelated endpoints.
async fn connect_ephemeral(peer: SocketAddr) -> Result<UdpSocket, TransferError> {
    let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(peer).await?;
    debug!("transfer socket {} connected to {}", socket.local_addr()?, peer);
    Ok(socket)
}

/// Report a terminal failure to the peer as one best-effort ERROR datagram.
async fn report_failure(socket: &UdpSocket, err: &TransferError) {
    if let Some(packet) = err.to_packet() {
        let _ = socket.send(&packet.encode()).await;
    }
}

/// Serve one download session.
pub async fn handle_read_request(
    peer: SocketAddr,
    filename: String,
    config: TransferConfig,
) -> Result<(), TransferError> {
    let socket = connect_ephemeral(peer).await?;
    match send_file(&socket, &filename, &config).await {
        Ok(()) => {
            info!("sent '{}' to {}", filename, peer);
            Ok(())
        }
        Err(err) => {
            report_failure(&socket, &err).await;
            Err(err)
        }
    }
}

/// Serve one upload session.
pub async fn handle_write_request(
    peer: SocketAddr,
    filename: String,
    config: TransferConfig,
) -> Result<(), TransferError> {
    let socket = connect_ephemeral(peer).await?;
    match receive_file(&socket, &filename, &config).await {
        Ok(()) => {
            info!("stored '{}' from {}", filename, peer);
            Ok(())
        }
        Err(err) => {
            report_failure(&socket, &err).await;
            Err(err)
        }
    }
}

/// Answer a datagram that was not a valid request. The reply comes from an
/// ephemeral socket like any other session traffic would.
pub async fn reject_request(peer: SocketAddr) -> Result<(), TransferError> {
    let socket = connect_ephemeral(peer).await?;
    report_failure(&socket, &TransferError::IllegalOperation).await;
    Ok(())
}

async fn send_file(
    socket: &UdpSocket,
    filename: &str,
    config: &TransferConfig,
) -> Result<(), TransferError> {
    let path = validate::resolve_under_root(&config.read_root, filename)?;
    validate::check_download_source(&path)?;
    let mut file = File::open(&path).await?;

    let mut block: u16 = 1;
    loop {
        let payload = read_block(&mut file).await?;
        // A short block, including an empty one, is the termination signal.
        // Files sized at an exact multiple of the block size therefore end
        // with an empty DATA packet.
        let last = payload.len() < BLOCK_SIZE;
        let sent = payload.len();
        let datagram = Packet::data(block, payload).encode();

        exchange(
            socket,
            Some(&datagram),
            config.timeout,
            config.max_retries,
            "ACK",
            |packet| match packet {
                Ok(Packet::Ack { block: acked }) if acked == block => Step::Accept(()),
                // Stale or wrong ACKs and undecodable datagrams count the
                // same as silence: the identical DATA packet goes out again.
                _ => Step::Retry,
            },
        )
        .await?;
        debug!("block {} acknowledged ({} bytes)", block, sent);

        if last {
            return Ok(());
        }
        block = block.wrapping_add(1);
    }
}

async fn receive_file(
    socket: &UdpSocket,
    filename: &str,
    config: &TransferConfig,
) -> Result<(), TransferError> {
    validate::check_extension(filename, &config.allowed_extensions)?;
    let path = validate::resolve_under_root(&config.write_root, filename)?;
    validate::check_upload_target(&path, &config.write_root)?;

    // ACK 0 accepts the request and tells the peer to start with block 1.
    socket.send(&Packet::ack(0).encode()).await?;
    let mut file = File::create(&path).await?;

    let mut expected: u16 = 1;
    let mut written: u64 = 0;
    loop {
        let (block, payload) = exchange(
            socket,
            None,
            config.timeout,
            1,
            "data",
            |packet| match packet {
                Ok(Packet::Data { block, payload }) => Step::Accept((block, payload)),
                _ => Step::Abort(TransferError::IllegalOperation),
            },
        )
        .await?;

        if block != expected {
            // Duplicate or stray block: drop the payload and re-acknowledge
            // the last in-sequence block, so a sender that missed our ACK
            // moves on while out-of-order data never reaches the file.
            debug!("ignoring block {} while expecting {}", block, expected);
            socket.send(&Packet::ack(expected.wrapping_sub(1)).encode()).await?;
            continue;
        }

        file.write_all(&payload).await?;
        written += payload.len() as u64;
        if written > config.max_upload_size {
            // Whatever made it to disk before the breach stays there.
            let _ = file.flush().await;
            return Err(TransferError::SizeLimitExceeded);
        }

        // The final ACK asserts receipt, so the short block must be on disk
        // before it goes out.
        let last = payload.len() < BLOCK_SIZE;
        if last {
            file.flush().await?;
        }
        socket.send(&Packet::ack(block).encode()).await?;
        debug!("block {} stored ({} bytes)", block, payload.len());

        if last {
            return Ok(());
        }
        expected = expected.wrapping_add(1);
    }
}

/// Read the next block, looping over short reads so only end of file can
/// produce a payload shorter than [`BLOCK_SIZE`].
async fn read_block(file: &mut File) -> std::io::Result<Vec<u8>> {
    let mut payload = vec![0u8; BLOCK_SIZE];
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = file.read(&mut payload[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    payload.truncate(filled);
    Ok(payload)
}
