//! Scripted TFTP peers for integration tests
//!
//! A scripted peer is a bare UDP socket driven by the test itself, so each
//! test decides exactly which packets are sent, dropped or repeated.
#![allow(dead_code)]

use bytes::Bytes;
use osprey_tftp::{ClientConfig, Packet, ServerConfig, ServerMode};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Upper bound on any single wait in a test
pub const GUARD: Duration = Duration::from_secs(5);

pub struct ScriptedPeer {
    pub socket: UdpSocket,
}

impl ScriptedPeer {
    pub async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub async fn send(&self, packet: &Packet, to: SocketAddr) {
        self.socket.send_to(&packet.encode(), to).await.unwrap();
    }

    /// Next packet; panics if nothing arrives within [`GUARD`].
    pub async fn recv(&self) -> (Packet, SocketAddr) {
        self.try_recv(GUARD)
            .await
            .expect("timed out waiting for a packet")
    }

    pub async fn try_recv(&self, wait: Duration) -> Option<(Packet, SocketAddr)> {
        let mut buf = [0u8; 1024];
        let (len, from) = tokio::time::timeout(wait, self.socket.recv_from(&mut buf))
            .await
            .ok()?
            .unwrap();
        Some((Packet::decode(&buf[..len]).unwrap(), from))
    }
}

pub fn data(block: u16, payload: &[u8]) -> Packet {
    Packet::Data {
        block,
        payload: Bytes::copy_from_slice(payload),
    }
}

/// Deterministic, non-repeating-per-block test content
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn client_config(timeout_ms: u64, max_retries: u32) -> ClientConfig {
    ClientConfig {
        timeout: Duration::from_millis(timeout_ms),
        max_retries,
        ..ClientConfig::default()
    }
}

pub fn server_config(root: &Path, mode: ServerMode) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.read_root = root.to_path_buf();
    config.mode = mode;
    config.timeout_ms = 200;
    config.max_retries = 3;
    config.buffer_pool_size = 4;
    config.logging.audit_enabled = false;
    config
}
