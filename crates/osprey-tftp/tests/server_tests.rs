//! Server dispatch against scripted clients

mod common;

use common::{GUARD, ScriptedPeer, data, pattern, server_config};
use osprey_tftp::packet::SEGMENT_SIZE;
use osprey_tftp::{
    ErrorCode, Packet, ServerConfig, ServerMode, ShutdownHandle, TftpServer, TransferMode,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::task::JoinHandle;

struct RunningServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    sessions: osprey_tftp::session::SessionRegistry,
    task: JoinHandle<osprey_tftp::Result<()>>,
}

impl RunningServer {
    async fn start(config: ServerConfig) -> Self {
        let server = TftpServer::new(config).bind().await.unwrap();
        Self {
            addr: server.local_addr(),
            shutdown: server.shutdown_handle(),
            sessions: server.sessions(),
            task: tokio::spawn(server.run()),
        }
    }

    async fn stop(self) {
        self.shutdown.shutdown();
        tokio::time::timeout(GUARD, self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn rrq(filename: &str) -> Packet {
    Packet::Rrq {
        filename: filename.to_string(),
        mode: TransferMode::Octet,
        options: Vec::new(),
    }
}

fn wrq(filename: &str) -> Packet {
    Packet::Wrq {
        filename: filename.to_string(),
        mode: TransferMode::Octet,
        options: Vec::new(),
    }
}

fn expect_error(packet: Packet, expected: ErrorCode) -> String {
    match packet {
        Packet::Error { code, message } => {
            assert_eq!(code, expected, "unexpected error message {message:?}");
            message
        }
        other => panic!("expected ERROR {expected:?}, got {other:?}"),
    }
}

#[tokio::test]
async fn test_upload_of_1300_bytes_lands_byte_for_byte() {
    let root = TempDir::new().unwrap();
    let server = RunningServer::start(server_config(root.path(), ServerMode::GetAndPut)).await;
    let client = ScriptedPeer::bind().await;
    let content = pattern(1300);

    client.send(&wrq("upload.bin"), server.addr).await;
    let (ack, session) = client.recv().await;
    assert_eq!(ack, Packet::Ack { block: 0 });
    assert_ne!(session, server.addr, "transfer must use its own port");

    let mut acks = Vec::new();
    for (index, chunk) in content.chunks(SEGMENT_SIZE).enumerate() {
        let block = index as u16 + 1;
        client.send(&data(block, chunk), session).await;
        let (packet, _) = client.recv().await;
        acks.push(packet);
    }
    assert_eq!(
        acks,
        vec![
            Packet::Ack { block: 1 },
            Packet::Ack { block: 2 },
            Packet::Ack { block: 3 }
        ]
    );

    let written = std::fs::read(root.path().join("upload.bin")).unwrap();
    assert_eq!(written, content);
    server.stop().await;
}

#[tokio::test]
async fn test_zero_byte_file_is_one_empty_block() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("empty"), b"").unwrap();
    let server = RunningServer::start(server_config(root.path(), ServerMode::GetOnly)).await;
    let client = ScriptedPeer::bind().await;

    client.send(&rrq("empty"), server.addr).await;
    let (packet, session) = client.recv().await;
    assert_eq!(packet, data(1, b""));
    client.send(&Packet::Ack { block: 1 }, session).await;

    assert!(client.try_recv(Duration::from_millis(400)).await.is_none());
    server.stop().await;
}

#[tokio::test]
async fn test_read_of_exact_segment_multiple_ends_with_empty_block() {
    let root = TempDir::new().unwrap();
    let content = pattern(SEGMENT_SIZE * 2);
    std::fs::write(root.path().join("two.bin"), &content).unwrap();
    let server = RunningServer::start(server_config(root.path(), ServerMode::GetOnly)).await;
    let client = ScriptedPeer::bind().await;

    client.send(&rrq("two.bin"), server.addr).await;
    let mut received = Vec::new();
    let mut sizes = Vec::new();
    loop {
        let (packet, session) = client.recv().await;
        let Packet::Data { block, payload } = packet else {
            panic!("expected DATA, got {packet:?}");
        };
        sizes.push(payload.len());
        received.extend_from_slice(&payload);
        client.send(&Packet::Ack { block }, session).await;
        if payload.len() < SEGMENT_SIZE {
            break;
        }
    }

    assert_eq!(sizes, vec![SEGMENT_SIZE, SEGMENT_SIZE, 0]);
    assert_eq!(received, content);
    server.stop().await;
}

#[tokio::test]
async fn test_read_block_numbers_wrap_after_65535() {
    let root = TempDir::new().unwrap();
    let full_blocks = 65_537usize;
    let mut content = vec![0x33u8; full_blocks * SEGMENT_SIZE];
    content.extend_from_slice(b"tail");
    std::fs::write(root.path().join("big.img"), &content).unwrap();
    let server = RunningServer::start(server_config(root.path(), ServerMode::GetOnly)).await;
    let client = ScriptedPeer::bind().await;

    client.send(&rrq("big.img"), server.addr).await;
    let mut expected: u16 = 1;
    let mut total = 0usize;
    loop {
        let (packet, session) = client.recv().await;
        let Packet::Data { block, payload } = packet else {
            panic!("expected DATA, got {packet:?}");
        };
        assert_eq!(block, expected);
        total += payload.len();
        client.send(&Packet::Ack { block }, session).await;
        expected = expected.wrapping_add(1);
        if payload.len() < SEGMENT_SIZE {
            break;
        }
    }

    assert_eq!(total, content.len());
    assert_eq!(expected, 3);
    server.stop().await;
}

#[tokio::test]
async fn test_missing_file_is_file_not_found() {
    let root = TempDir::new().unwrap();
    let server = RunningServer::start(server_config(root.path(), ServerMode::GetAndPut)).await;
    let client = ScriptedPeer::bind().await;

    client.send(&rrq("nope.bin"), server.addr).await;
    expect_error(client.recv().await.0, ErrorCode::FileNotFound);
    server.stop().await;
}

#[tokio::test]
async fn test_sandbox_escape_is_rejected_without_touching_files() {
    let outer = TempDir::new().unwrap();
    let root = outer.path().join("root");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(outer.path().join("secret"), b"top secret").unwrap();
    let server = RunningServer::start(server_config(&root, ServerMode::GetAndPut)).await;
    let client = ScriptedPeer::bind().await;

    client.send(&rrq("../secret"), server.addr).await;
    expect_error(client.recv().await.0, ErrorCode::AccessViolation);

    client.send(&rrq("../../etc/passwd"), server.addr).await;
    expect_error(client.recv().await.0, ErrorCode::AccessViolation);

    client.send(&wrq("../escaped.txt"), server.addr).await;
    expect_error(client.recv().await.0, ErrorCode::AccessViolation);
    assert!(!outer.path().join("escaped.txt").exists());

    server.stop().await;
}

#[tokio::test]
async fn test_get_only_server_refuses_writes() {
    let root = TempDir::new().unwrap();
    let server = RunningServer::start(server_config(root.path(), ServerMode::GetOnly)).await;
    let client = ScriptedPeer::bind().await;

    client.send(&wrq("new.txt"), server.addr).await;
    let message = expect_error(client.recv().await.0, ErrorCode::IllegalOperation);
    assert_eq!(message, "Write not allowed by server.");
    assert!(!root.path().join("new.txt").exists());
    server.stop().await;
}

#[tokio::test]
async fn test_put_only_server_refuses_reads() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("present.txt"), b"here").unwrap();
    let server = RunningServer::start(server_config(root.path(), ServerMode::PutOnly)).await;
    let client = ScriptedPeer::bind().await;

    client.send(&rrq("present.txt"), server.addr).await;
    let message = expect_error(client.recv().await.0, ErrorCode::IllegalOperation);
    assert_eq!(message, "Read not allowed by server.");
    server.stop().await;
}

#[tokio::test]
async fn test_existing_file_is_never_overwritten() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("keep.txt"), b"original").unwrap();
    let server = RunningServer::start(server_config(root.path(), ServerMode::GetAndPut)).await;
    let client = ScriptedPeer::bind().await;

    client.send(&wrq("keep.txt"), server.addr).await;
    expect_error(client.recv().await.0, ErrorCode::FileExists);
    assert_eq!(std::fs::read(root.path().join("keep.txt")).unwrap(), b"original");
    server.stop().await;
}

#[tokio::test]
async fn test_oversized_read_is_refused() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("large.bin"), pattern(2048)).unwrap();
    let mut config = server_config(root.path(), ServerMode::GetOnly);
    config.max_file_size_bytes = 1024;
    let server = RunningServer::start(config).await;
    let client = ScriptedPeer::bind().await;

    client.send(&rrq("large.bin"), server.addr).await;
    let message = expect_error(client.recv().await.0, ErrorCode::DiskFull);
    assert_eq!(message, "File too large");
    server.stop().await;
}

#[tokio::test]
async fn test_oversized_upload_is_aborted_and_removed() {
    let root = TempDir::new().unwrap();
    let mut config = server_config(root.path(), ServerMode::PutOnly);
    config.max_file_size_bytes = 600;
    let server = RunningServer::start(config).await;
    let client = ScriptedPeer::bind().await;
    let content = pattern(SEGMENT_SIZE * 2);

    client.send(&wrq("huge.bin"), server.addr).await;
    let (_, session) = client.recv().await;
    client.send(&data(1, &content[..SEGMENT_SIZE]), session).await;
    assert_eq!(client.recv().await.0, Packet::Ack { block: 1 });
    client.send(&data(2, &content[SEGMENT_SIZE..]), session).await;
    expect_error(client.recv().await.0, ErrorCode::DiskFull);

    server.stop().await;
    assert!(!root.path().join("huge.bin").exists());
}

#[tokio::test]
async fn test_non_request_on_listener_is_illegal_operation() {
    let root = TempDir::new().unwrap();
    let server = RunningServer::start(server_config(root.path(), ServerMode::GetAndPut)).await;
    let client = ScriptedPeer::bind().await;

    client.send(&Packet::Ack { block: 1 }, server.addr).await;
    expect_error(client.recv().await.0, ErrorCode::IllegalOperation);

    client.socket.send_to(&[0, 1, b'x'], server.addr).await.unwrap();
    expect_error(client.recv().await.0, ErrorCode::IllegalOperation);
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_sessions_promptly() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("slow.bin"), pattern(SEGMENT_SIZE * 4)).unwrap();
    let mut config = server_config(root.path(), ServerMode::GetOnly);
    config.timeout_ms = 10_000;
    config.max_retries = 5;
    let server = RunningServer::start(config).await;
    let client = ScriptedPeer::bind().await;

    client.send(&rrq("slow.bin"), server.addr).await;
    let (first, _) = client.recv().await;
    assert!(matches!(first, Packet::Data { block: 1, .. }));
    assert_eq!(server.sessions.len(), 1);

    // never acknowledge; shutdown must not wait out the 10s timeout
    let sessions = server.sessions.clone();
    let started = Instant::now();
    server.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(sessions.is_empty());

    let (goodbye, _) = client.recv().await;
    expect_error(goodbye, ErrorCode::NotDefined);
}

#[tokio::test]
async fn test_sessions_run_concurrently() {
    let root = TempDir::new().unwrap();
    for name in ["a.bin", "b.bin"] {
        std::fs::write(root.path().join(name), pattern(SEGMENT_SIZE + 10)).unwrap();
    }
    let server = RunningServer::start(server_config(root.path(), ServerMode::GetOnly)).await;
    let first = ScriptedPeer::bind().await;
    let second = ScriptedPeer::bind().await;

    first.send(&rrq("a.bin"), server.addr).await;
    second.send(&rrq("b.bin"), server.addr).await;
    let (_, first_session) = first.recv().await;
    let (_, second_session) = second.recv().await;
    assert_ne!(first_session, second_session);

    // the second transfer finishes while the first one stalls
    second.send(&Packet::Ack { block: 1 }, second_session).await;
    let (last, _) = second.recv().await;
    assert!(matches!(last, Packet::Data { block: 2, .. }));
    second.send(&Packet::Ack { block: 2 }, second_session).await;

    first.send(&Packet::Ack { block: 1 }, first_session).await;
    let (last, _) = first.recv().await;
    assert!(matches!(last, Packet::Data { block: 2, .. }));
    first.send(&Packet::Ack { block: 2 }, first_session).await;

    server.stop().await;
}

#[tokio::test]
async fn test_resent_data_block_is_reacked_without_duplicating_upload() {
    let root = TempDir::new().unwrap();
    let server = RunningServer::start(server_config(root.path(), ServerMode::PutOnly)).await;
    let client = ScriptedPeer::bind().await;
    let first = pattern(SEGMENT_SIZE);

    client.send(&wrq("twice.bin"), server.addr).await;
    let (_, session) = client.recv().await;
    client.send(&data(1, &first), session).await;
    assert_eq!(client.recv().await.0, Packet::Ack { block: 1 });

    // our ACK 1 was "lost", so block 1 goes out again
    client.send(&data(1, &first), session).await;
    assert_eq!(client.recv().await.0, Packet::Ack { block: 1 });

    client.send(&data(2, b"end"), session).await;
    assert_eq!(client.recv().await.0, Packet::Ack { block: 2 });

    let written = std::fs::read(root.path().join("twice.bin")).unwrap();
    assert_eq!(written.len(), SEGMENT_SIZE + 3);
    assert_eq!(&written[..SEGMENT_SIZE], &first[..]);
    assert!(written.ends_with(b"end"));
    server.stop().await;
}

#[tokio::test]
async fn test_resent_write_request_joins_the_live_session() {
    let root = TempDir::new().unwrap();
    let server = RunningServer::start(server_config(root.path(), ServerMode::PutOnly)).await;
    let client = ScriptedPeer::bind().await;

    client.send(&wrq("retry.bin"), server.addr).await;
    let (ack, session) = client.recv().await;
    assert_eq!(ack, Packet::Ack { block: 0 });

    // as if ACK 0 never arrived
    client.send(&wrq("retry.bin"), server.addr).await;
    if let Some((packet, from)) = client.try_recv(Duration::from_millis(150)).await {
        assert_eq!(from, session, "a second session answered with {packet:?}");
        assert_eq!(packet, Packet::Ack { block: 0 });
    }
    assert_eq!(server.sessions.len(), 1);

    client.send(&data(1, b"payload"), session).await;
    loop {
        let (packet, from) = client.recv().await;
        assert_eq!(from, session);
        if packet == (Packet::Ack { block: 1 }) {
            break;
        }
        assert_eq!(packet, Packet::Ack { block: 0 });
    }
    assert_eq!(std::fs::read(root.path().join("retry.bin")).unwrap(), b"payload");
    server.stop().await;
}

#[tokio::test]
async fn test_failed_upload_removes_directories_it_created() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir(root.path().join("existing")).unwrap();
    let mut config = server_config(root.path(), ServerMode::PutOnly);
    config.max_file_size_bytes = 600;
    let server = RunningServer::start(config).await;
    let content = pattern(SEGMENT_SIZE * 2);

    for name in ["new/deeper/huge.bin", "existing/huge.bin"] {
        let client = ScriptedPeer::bind().await;
        client.send(&wrq(name), server.addr).await;
        let (_, session) = client.recv().await;
        client.send(&data(1, &content[..SEGMENT_SIZE]), session).await;
        assert_eq!(client.recv().await.0, Packet::Ack { block: 1 });
        client.send(&data(2, &content[SEGMENT_SIZE..]), session).await;
        expect_error(client.recv().await.0, ErrorCode::DiskFull);
    }

    server.stop().await;
    assert!(!root.path().join("new").exists());
    assert!(root.path().join("existing").is_dir());
    assert!(!root.path().join("existing/huge.bin").exists());
}
