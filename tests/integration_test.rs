//! End-to-end transfers against a really bound server over loopback UDP.
//!
//! The client side is scripted by hand on raw sockets, so these tests pin the
//! wire behavior (block numbering, retransmission, error reports) and not
//! just the library API.

use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use tftpd::{Packet, RequestKind, ServerConfig, TftpServer, TransferConfig, BLOCK_SIZE};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: SocketAddr,
    read_root: TempDir,
    write_root: TempDir,
}

/// Bind a server on an ephemeral loopback port with shortened timings and
/// run it in the background for the rest of the test.
async fn start_server(tweak: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let read_root = tempdir().unwrap();
    let write_root = tempdir().unwrap();
    let mut config = ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        max_transfers: 8,
        transfer: TransferConfig {
            read_root: read_root.path().to_path_buf(),
            write_root: write_root.path().to_path_buf(),
            // Long enough that the server never retransmits while a test is
            // mid-script, short enough to keep the timeout tests quick.
            timeout: Duration::from_secs(1),
            max_retries: 3,
            ..TransferConfig::default()
        },
    };
    tweak(&mut config);

    let mut server = TftpServer::new(config);
    server.bind().await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    TestServer {
        addr,
        read_root,
        write_root,
    }
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

fn request(kind: RequestKind, filename: &str) -> Vec<u8> {
    Packet::Request {
        kind,
        filename: filename.to_string(),
        mode: "octet".to_string(),
    }
    .encode()
}

/// Bytes that do not repeat on block boundaries, so reordered or duplicated
/// blocks cannot reassemble into the original content by accident.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = [0u8; 1024];
    let (len, from) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for the server")
        .unwrap();
    let packet = Packet::decode(&buf[..len]).expect("server sent an undecodable datagram");
    (packet, from)
}

async fn expect_silence(socket: &UdpSocket, wait: Duration) {
    let mut buf = [0u8; 1024];
    if let Ok(Ok((len, _))) = timeout(wait, socket.recv_from(&mut buf)).await {
        panic!("expected silence, got {:?}", Packet::decode(&buf[..len]));
    }
}

/// Run a full download, acknowledging every block. Returns the DATA blocks
/// in arrival order, or the terminal error report.
async fn download(
    server: SocketAddr,
    filename: &str,
) -> Result<Vec<(u16, Vec<u8>)>, (u16, String)> {
    let socket = client().await;
    socket
        .send_to(&request(RequestKind::Read, filename), server)
        .await
        .unwrap();

    let mut peer: Option<SocketAddr> = None;
    let mut blocks = Vec::new();
    loop {
        let (packet, from) = recv_packet(&socket).await;
        // All session traffic must come from one transfer socket.
        assert_eq!(*peer.get_or_insert(from), from);
        match packet {
            Packet::Data { block, payload } => {
                let done = payload.len() < BLOCK_SIZE;
                socket
                    .send_to(&Packet::ack(block).encode(), from)
                    .await
                    .unwrap();
                blocks.push((block, payload));
                if done {
                    return Ok(blocks);
                }
            }
            Packet::Error { code, message } => return Err((code, message)),
            other => panic!("unexpected packet during download: {other:?}"),
        }
    }
}

/// Run a full upload in 512-byte blocks, ending with a short or empty block.
async fn upload(server: SocketAddr, filename: &str, content: &[u8]) -> Result<(), (u16, String)> {
    let socket = client().await;
    socket
        .send_to(&request(RequestKind::Write, filename), server)
        .await
        .unwrap();

    let (packet, peer) = recv_packet(&socket).await;
    match packet {
        Packet::Ack { block: 0 } => {}
        Packet::Error { code, message } => return Err((code, message)),
        other => panic!("expected ACK 0, got {other:?}"),
    }

    let mut chunks: Vec<Vec<u8>> = content.chunks(BLOCK_SIZE).map(|c| c.to_vec()).collect();
    if content.is_empty() || content.len() % BLOCK_SIZE == 0 {
        chunks.push(Vec::new());
    }

    for (i, chunk) in chunks.into_iter().enumerate() {
        let block = (i + 1) as u16;
        socket
            .send_to(&Packet::data(block, chunk).encode(), peer)
            .await
            .unwrap();
        let (packet, _) = recv_packet(&socket).await;
        match packet {
            Packet::Ack { block: acked } if acked == block => {}
            Packet::Error { code, message } => return Err((code, message)),
            other => panic!("expected ACK {block}, got {other:?}"),
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_download_splits_into_512_byte_blocks() {
    let srv = start_server(|_| {}).await;
    let content = pattern(600);
    fs::write(srv.read_root.path().join("paged.txt"), &content).unwrap();

    let blocks = download(srv.addr, "paged.txt").await.unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].0, 1);
    assert_eq!(blocks[0].1.len(), BLOCK_SIZE);
    assert_eq!(blocks[1].0, 2);
    assert_eq!(blocks[1].1.len(), 88);

    let received: Vec<u8> = blocks.into_iter().flat_map(|(_, p)| p).collect();
    assert_eq!(received, content);
}

#[tokio::test]
async fn test_download_of_exact_multiple_ends_with_empty_block() {
    let srv = start_server(|_| {}).await;
    let content = pattern(2 * BLOCK_SIZE);
    fs::write(srv.read_root.path().join("aligned.bin"), &content).unwrap();

    let blocks = download(srv.addr, "aligned.bin").await.unwrap();
    let sizes: Vec<(u16, usize)> = blocks.iter().map(|(b, p)| (*b, p.len())).collect();
    assert_eq!(sizes, vec![(1, BLOCK_SIZE), (2, BLOCK_SIZE), (3, 0)]);

    let received: Vec<u8> = blocks.into_iter().flat_map(|(_, p)| p).collect();
    assert_eq!(received, content);
}

#[tokio::test]
async fn test_download_of_empty_file_is_one_empty_block() {
    let srv = start_server(|_| {}).await;
    fs::write(srv.read_root.path().join("empty.txt"), b"").unwrap();

    let blocks = download(srv.addr, "empty.txt").await.unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].0, 1);
    assert!(blocks[0].1.is_empty());
}

#[tokio::test]
async fn test_download_missing_file_reports_not_found() {
    let srv = start_server(|_| {}).await;
    let err = download(srv.addr, "absent.txt").await.unwrap_err();
    assert_eq!(err, (1, "File not found".to_string()));
}

#[tokio::test]
async fn test_download_rejects_path_traversal() {
    let srv = start_server(|_| {}).await;

    // Rejected before any filesystem access, whether or not a file exists
    // at the escaped path.
    let err = download(srv.addr, "../secret.txt").await.unwrap_err();
    assert_eq!(err, (2, "Access violation".to_string()));

    let err = download(srv.addr, "/etc/passwd").await.unwrap_err();
    assert_eq!(err, (2, "Access violation".to_string()));
}

#[tokio::test]
async fn test_wrong_ack_retransmits_the_same_block() {
    let srv = start_server(|_| {}).await;
    let content = pattern(600);
    fs::write(srv.read_root.path().join("paged.txt"), &content).unwrap();

    let socket = client().await;
    socket
        .send_to(&request(RequestKind::Read, "paged.txt"), srv.addr)
        .await
        .unwrap();

    let (first, peer) = recv_packet(&socket).await;
    assert_ne!(peer, srv.addr);
    let Packet::Data { block: 1, payload: first_payload } = first else {
        panic!("expected DATA 1, got {first:?}");
    };

    // An ACK for a block that was never sent must not advance the transfer.
    socket
        .send_to(&Packet::ack(99).encode(), peer)
        .await
        .unwrap();
    let (resent, _) = recv_packet(&socket).await;
    assert_eq!(
        resent,
        Packet::Data {
            block: 1,
            payload: first_payload.clone(),
        }
    );

    socket.send_to(&Packet::ack(1).encode(), peer).await.unwrap();
    let (second, _) = recv_packet(&socket).await;
    let Packet::Data { block: 2, payload } = second else {
        panic!("expected DATA 2, got {second:?}");
    };
    assert_eq!(payload.len(), 88);
    socket.send_to(&Packet::ack(2).encode(), peer).await.unwrap();

    expect_silence(&socket, Duration::from_millis(1500)).await;
}

#[tokio::test]
async fn test_silent_client_exhausts_retries_then_gets_timeout_error() {
    let srv = start_server(|_| {}).await;
    fs::write(srv.read_root.path().join("slow.txt"), pattern(64)).unwrap();

    let socket = client().await;
    socket
        .send_to(&request(RequestKind::Read, "slow.txt"), srv.addr)
        .await
        .unwrap();

    // Never acknowledge anything: every attempt resends DATA 1, and the
    // session ends with a timeout report once the budget is spent.
    let mut copies: Vec<Vec<u8>> = Vec::new();
    loop {
        let (packet, _) = recv_packet(&socket).await;
        match packet {
            Packet::Data { block, payload } => {
                assert_eq!(block, 1);
                copies.push(payload);
            }
            Packet::Error { code, message } => {
                assert_eq!(code, 0);
                assert_eq!(message, "Timeout waiting for ACK");
                break;
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }
    assert_eq!(copies.len(), 3);
    assert!(copies.windows(2).all(|w| w[0] == w[1]));

    expect_silence(&socket, Duration::from_millis(1500)).await;
}

#[tokio::test]
async fn test_client_error_stops_the_download_silently() {
    let srv = start_server(|_| {}).await;
    fs::write(srv.read_root.path().join("paged.txt"), pattern(600)).unwrap();

    let socket = client().await;
    socket
        .send_to(&request(RequestKind::Read, "paged.txt"), srv.addr)
        .await
        .unwrap();

    let (packet, peer) = recv_packet(&socket).await;
    assert!(matches!(packet, Packet::Data { block: 1, .. }));
    socket
        .send_to(&Packet::error(0, "user abort").encode(), peer)
        .await
        .unwrap();

    // No retransmission and no counter-ERROR: the session just ends.
    expect_silence(&socket, Duration::from_millis(1500)).await;
}

#[tokio::test]
async fn test_upload_round_trip() {
    let srv = start_server(|_| {}).await;
    let content = pattern(700);

    upload(srv.addr, "report.pdf", &content).await.unwrap();
    assert_eq!(fs::read(srv.write_root.path().join("report.pdf")).unwrap(), content);
}

#[tokio::test]
async fn test_upload_of_exact_multiple_round_trips() {
    let srv = start_server(|_| {}).await;
    let content = pattern(BLOCK_SIZE);

    upload(srv.addr, "aligned.png", &content).await.unwrap();
    assert_eq!(fs::read(srv.write_root.path().join("aligned.png")).unwrap(), content);
}

#[tokio::test]
async fn test_upload_of_empty_file_round_trips() {
    let srv = start_server(|_| {}).await;

    upload(srv.addr, "empty.txt", b"").await.unwrap();
    let stored = fs::read(srv.write_root.path().join("empty.txt")).unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn test_upload_with_disallowed_extension_is_refused_before_ack() {
    let srv = start_server(|_| {}).await;

    // The first reply must already be the refusal. An ACK 0 here would
    // invite the client to start sending data.
    let err = upload(srv.addr, "payload.exe", &pattern(100)).await.unwrap_err();
    assert_eq!(err, (0, "Invalid file type".to_string()));
    assert!(!srv.write_root.path().join("payload.exe").exists());
}

#[tokio::test]
async fn test_upload_refuses_to_overwrite() {
    let srv = start_server(|_| {}).await;
    fs::write(srv.write_root.path().join("taken.txt"), b"original").unwrap();

    let err = upload(srv.addr, "taken.txt", &pattern(10)).await.unwrap_err();
    assert_eq!(err, (6, "File already exists".to_string()));
    // The original is untouched.
    assert_eq!(
        fs::read(srv.write_root.path().join("taken.txt")).unwrap(),
        b"original"
    );
}

#[tokio::test]
async fn test_upload_past_the_size_ceiling_is_aborted_mid_transfer() {
    let srv = start_server(|config| {
        config.transfer.max_upload_size = 1000;
    })
    .await;

    let err = upload(srv.addr, "big.txt", &pattern(2000)).await.unwrap_err();
    assert_eq!(err, (0, "File exceeds size limit".to_string()));

    // Both blocks accepted before the breach was detected stay on disk.
    let partial = fs::read(srv.write_root.path().join("big.txt")).unwrap();
    assert_eq!(partial.len(), 2 * BLOCK_SIZE);
    assert_eq!(partial, pattern(2000)[..2 * BLOCK_SIZE]);
}

#[tokio::test]
async fn test_upload_out_of_sequence_block_is_reacked_not_stored() {
    let srv = start_server(|_| {}).await;

    let socket = client().await;
    socket
        .send_to(&request(RequestKind::Write, "notes.txt"), srv.addr)
        .await
        .unwrap();
    let (packet, peer) = recv_packet(&socket).await;
    assert_eq!(packet, Packet::Ack { block: 0 });

    // A block the server is not expecting: even though it is short, it must
    // not end the transfer, and its payload must not reach the file. The
    // server re-acknowledges the last in-sequence block instead.
    socket
        .send_to(&Packet::data(2, b"stray".to_vec()).encode(), peer)
        .await
        .unwrap();
    let (packet, _) = recv_packet(&socket).await;
    assert_eq!(packet, Packet::Ack { block: 0 });

    socket
        .send_to(&Packet::data(1, b"real content".to_vec()).encode(), peer)
        .await
        .unwrap();
    let (packet, _) = recv_packet(&socket).await;
    assert_eq!(packet, Packet::Ack { block: 1 });

    assert_eq!(
        fs::read(srv.write_root.path().join("notes.txt")).unwrap(),
        b"real content"
    );
    expect_silence(&socket, Duration::from_millis(1500)).await;
}

#[tokio::test]
async fn test_upload_that_goes_quiet_times_out() {
    let srv = start_server(|_| {}).await;

    let socket = client().await;
    socket
        .send_to(&request(RequestKind::Write, "quiet.txt"), srv.addr)
        .await
        .unwrap();
    let (packet, _) = recv_packet(&socket).await;
    assert_eq!(packet, Packet::Ack { block: 0 });

    // Send nothing. The accepted but never-filled file stays behind, empty.
    let (packet, _) = recv_packet(&socket).await;
    assert_eq!(
        packet,
        Packet::Error {
            code: 0,
            message: "Timeout waiting for data".to_string(),
        }
    );
    let stored = fs::read(srv.write_root.path().join("quiet.txt")).unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn test_non_request_datagrams_on_the_request_socket_are_rejected() {
    let srv = start_server(|_| {}).await;
    let socket = client().await;

    // A mid-transfer opcode, an unknown opcode and a request without its
    // terminators all get the same answer.
    let bad: Vec<Vec<u8>> = vec![
        Packet::ack(5).encode(),
        b"\x00\x09junk".to_vec(),
        b"\x00\x01file.txt".to_vec(),
    ];
    for datagram in &bad {
        socket.send_to(datagram, srv.addr).await.unwrap();
    }

    for _ in 0..bad.len() {
        let (packet, from) = recv_packet(&socket).await;
        // Rejections come from a worker's ephemeral socket, not the
        // request socket.
        assert_ne!(from, srv.addr);
        assert_eq!(
            packet,
            Packet::Error {
                code: 4,
                message: "Illegal TFTP operation".to_string(),
            }
        );
    }
}

#[tokio::test]
async fn test_non_octet_mode_is_rejected() {
    let srv = start_server(|_| {}).await;
    fs::write(srv.read_root.path().join("readme.txt"), b"hello").unwrap();

    let socket = client().await;
    let rrq = Packet::Request {
        kind: RequestKind::Read,
        filename: "readme.txt".to_string(),
        mode: "netascii".to_string(),
    }
    .encode();
    socket.send_to(&rrq, srv.addr).await.unwrap();

    let (packet, _) = recv_packet(&socket).await;
    assert_eq!(
        packet,
        Packet::Error {
            code: 4,
            message: "Illegal TFTP operation".to_string(),
        }
    );
}

#[tokio::test]
async fn test_concurrent_downloads_are_isolated() {
    let srv = start_server(|_| {}).await;
    let first = pattern(600);
    let second: Vec<u8> = pattern(1300).into_iter().rev().collect();
    fs::write(srv.read_root.path().join("first.txt"), &first).unwrap();
    fs::write(srv.read_root.path().join("second.txt"), &second).unwrap();

    let (a, b) = tokio::join!(
        download(srv.addr, "first.txt"),
        download(srv.addr, "second.txt")
    );

    let a: Vec<u8> = a.unwrap().into_iter().flat_map(|(_, p)| p).collect();
    let b: Vec<u8> = b.unwrap().into_iter().flat_map(|(_, p)| p).collect();
    assert_eq!(a, first);
    assert_eq!(b, second);
}
